use std::fs;
use std::path::{Path, PathBuf};

const CAPITAL_OWNER: &str = "src/strategy/allocator.rs";

fn collect_rust_files(root: &Path, out: &mut Vec<PathBuf>) {
    let Ok(entries) = fs::read_dir(root) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            collect_rust_files(&path, out);
            continue;
        }
        if path.extension().and_then(|s| s.to_str()) == Some("rs") {
            out.push(path);
        }
    }
}

/// The allocator is the only component permitted to mutate aggregate capital
/// counters. Everything else reads snapshots or goes through its methods.
#[test]
fn capital_counters_are_mutated_only_by_the_allocator() {
    let repo_root = Path::new(env!("CARGO_MANIFEST_DIR"));
    let src_root = repo_root.join("src");
    let mut files = Vec::new();
    collect_rust_files(&src_root, &mut files);

    let mutation_markers = [
        ".committed.entry(",
        ".daily_forecast_spend +=",
        ".daily_realized_loss +=",
        ".total_capital =",
        ".peak_equity =",
    ];

    let mut offenders = Vec::new();
    for file in files {
        let rel = file
            .strip_prefix(repo_root)
            .unwrap_or(&file)
            .to_string_lossy()
            .replace('\\', "/");
        if rel == CAPITAL_OWNER {
            continue;
        }
        let content = fs::read_to_string(&file).unwrap_or_default();
        for (idx, line) in content.lines().enumerate() {
            let trimmed = line.trim();
            if mutation_markers.iter().any(|marker| trimmed.contains(marker)) {
                offenders.push(format!("{rel}:{}: {}", idx + 1, trimmed));
            }
        }
    }

    assert!(
        offenders.is_empty(),
        "capital counter mutation detected outside the allocator:\n{}",
        offenders.join("\n")
    );
}
