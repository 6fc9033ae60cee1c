//! # cowrite CLI
//!
//! Offline utilities for snapshot files written by `save`.

use anyhow::{bail, Context, Result};
use cowrite_core::{codec, Document};
use std::env;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};

fn main() -> Result<()> {
    let args: Vec<String> = env::args().collect();

    if args.len() < 2 {
        print_help();
        return Ok(());
    }

    match args[1].as_str() {
        "content" => {
            if args.len() < 3 {
                eprintln!("Usage: cowrite-tool content <file>");
                std::process::exit(1);
            }
            print!("{}", load(Path::new(&args[2]))?.content());
        }
        "inspect" => {
            if args.len() < 3 {
                eprintln!("Usage: cowrite-tool inspect <file> [--json]");
                std::process::exit(1);
            }
            let doc = load(Path::new(&args[2]))?;
            if args.get(3).is_some_and(|flag| flag == "--json") {
                println!("{}", serde_json::to_string_pretty(&inspect_json(&doc))?);
            } else {
                print!("{}", inspect_text(&doc));
            }
        }
        "merge" => {
            if args.len() < 4 {
                eprintln!("Usage: cowrite-tool merge <output> <input>...");
                std::process::exit(1);
            }
            let inputs: Vec<PathBuf> = args[3..].iter().map(PathBuf::from).collect();
            let merged = merge_files(&inputs)?;
            codec::save(Path::new(&args[2]), &merged)
                .with_context(|| format!("Failed to write {}", args[2]))?;
            println!(
                "merged {} file(s) into {}: {} chars",
                inputs.len(),
                args[2],
                merged.len()
            );
        }
        "help" | "--help" | "-h" => {
            print_help();
        }
        cmd => {
            eprintln!("Unknown command: {cmd}");
            print_help();
            std::process::exit(1);
        }
    }

    Ok(())
}

fn load(path: &Path) -> Result<Document> {
    codec::load(path).with_context(|| format!("Failed to load {}", path.display()))
}

fn merge_files(inputs: &[PathBuf]) -> Result<Document> {
    let Some((first, rest)) = inputs.split_first() else {
        bail!("no input files");
    };

    let mut merged = load(first)?;
    for path in rest {
        merged.merge(&load(path)?);
    }
    Ok(merged)
}

fn inspect_text(doc: &Document) -> String {
    let mut out = String::new();
    for node in doc.nodes() {
        let _ = writeln!(
            out,
            "{:<24} {:?} {}{}",
            node.id.to_string(),
            node.value,
            node.dot(),
            if node.tombstoned { " deleted" } else { "" }
        );
    }

    let counters: Vec<String> = doc
        .counters()
        .iter()
        .map(|(site, counter)| format!("{site}:{counter}"))
        .collect();
    let _ = writeln!(
        out,
        "{} visible, {} nodes, counters [{}], {} pending deletes",
        doc.len(),
        doc.node_count(),
        counters.join(" "),
        doc.pending_deletes().count()
    );
    out
}

fn inspect_json(doc: &Document) -> serde_json::Value {
    serde_json::json!({
        "content": doc.content(),
        "nodes": doc.nodes().collect::<Vec<_>>(),
        "counters": doc.counters(),
        "pendingDeletes": doc.pending_deletes().collect::<Vec<_>>(),
    })
}

fn print_help() {
    println!(
        r#"cowrite CLI

USAGE:
    cowrite-tool <COMMAND> [OPTIONS]

COMMANDS:
    content <file>              Print the visible text of a snapshot
    inspect <file> [--json]     List every node, tombstones included
    merge <output> <input>...   Merge snapshots and write the result
    help                        Show this help message

EXAMPLES:
    cowrite-tool content notes.cw
    cowrite-tool merge joined.cw mine.cw theirs.cw
"#
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_doc(dir: &Path, name: &str, text: &str, site: u64) -> PathBuf {
        let mut doc = Document::new();
        for (i, c) in text.chars().enumerate() {
            doc.local_insert(i, c, site).unwrap();
        }
        let path = dir.join(name);
        codec::save(&path, &doc).unwrap();
        path
    }

    #[test]
    fn merges_independent_files() {
        let dir = tempfile::tempdir().unwrap();
        let a = write_doc(dir.path(), "a.cw", "ab", 1);
        let b = write_doc(dir.path(), "b.cw", "cd", 2);

        let merged = merge_files(&[a.clone(), b]).unwrap();
        assert_eq!(merged.len(), 4);
        assert_eq!(merged.max_counter(1), 2);
        assert_eq!(merged.max_counter(2), 2);

        let again = merge_files(&[a.clone(), a]).unwrap();
        assert_eq!(again.content(), "ab");
    }

    #[test]
    fn merge_needs_inputs() {
        assert!(merge_files(&[]).is_err());
    }

    #[test]
    fn inspect_lists_tombstones() {
        let mut doc = Document::new();
        doc.local_insert(0, 'x', 3).unwrap();
        doc.local_insert(1, 'y', 3).unwrap();
        doc.local_delete(0).unwrap();

        let text = inspect_text(&doc);
        assert!(text.contains("'x' 3:1 deleted"));
        assert!(text.contains("'y' 3:2\n"));
        assert!(text.ends_with("1 visible, 2 nodes, counters [3:2], 0 pending deletes\n"));

        let json = inspect_json(&doc);
        assert_eq!(json["content"], "y");
        assert_eq!(json["nodes"].as_array().unwrap().len(), 2);
    }
}
