//! CFG dump inspector: parse a dump, print the block model and, with a
//! mapping loaded, the current uncovered frontier.
//!
//! Usage:
//!   magpie-cfg <dump.cfg> [--mapping coverage_mapping.json] [--target FN]...

use std::path::PathBuf;
use std::process::exit;
use std::sync::Arc;

use magpie_core::cfg::analyzer::AnalyzerOptions;
use magpie_core::cfg::parse_cfg_dump;
use magpie_core::{source_file_from_cfg_path, CfgAnalyzer, CoverageMapping};

struct Args {
    dump: PathBuf,
    mapping: Option<PathBuf>,
    targets: Vec<String>,
}

fn parse_args() -> Args {
    let argv: Vec<String> = std::env::args().skip(1).collect();
    let mut dump = None;
    let mut mapping = None;
    let mut targets = Vec::new();
    let mut i = 0;
    while i < argv.len() {
        match argv[i].as_str() {
            "--mapping" if i + 1 < argv.len() => {
                i += 1;
                mapping = Some(PathBuf::from(&argv[i]));
            }
            "--target" if i + 1 < argv.len() => {
                i += 1;
                targets.push(argv[i].clone());
            }
            flag if flag.starts_with("--") => {
                eprintln!("unknown flag: {flag}");
                exit(2);
            }
            path => dump = Some(PathBuf::from(path)),
        }
        i += 1;
    }
    let Some(dump) = dump else {
        eprintln!("Usage: magpie-cfg <dump.cfg> [--mapping FILE] [--target FN]...");
        exit(2);
    };
    Args { dump, mapping, targets }
}

fn main() {
    let args = parse_args();

    let functions = match parse_cfg_dump(&args.dump) {
        Ok(f) => f,
        Err(e) => {
            eprintln!("error: {e}");
            exit(1);
        }
    };
    println!(
        "{} function(s) in {} (source {})",
        functions.len(),
        args.dump.display(),
        source_file_from_cfg_path(&args.dump).display()
    );

    let mapping = Arc::new(CoverageMapping::new(0));
    if let Some(path) = &args.mapping {
        if let Err(e) = mapping.load_from(path) {
            eprintln!("error: {e}");
            exit(1);
        }
        println!("mapping: {} covered line(s)", mapping.total_covered_lines());
    }

    let targets = if args.targets.is_empty() {
        functions.keys().cloned().collect()
    } else {
        args.targets.clone()
    };

    for (name, func) in &functions {
        let edge_count: usize = func.succs.values().map(Vec::len).sum();
        let line_count: usize = func.blocks.values().map(|b| b.lines.len()).sum();
        println!(
            "  {name} ({}): {} block(s), {} edge(s), {} line(s)",
            func.mangled_name,
            func.blocks.len(),
            edge_count,
            line_count
        );
    }

    let mut analyzer =
        match CfgAnalyzer::new(functions, targets.clone(), mapping.clone(), AnalyzerOptions::default()) {
            Ok(a) => a,
            Err(e) => {
                eprintln!("error: {e}");
                exit(1);
            }
        };

    let covered = mapping.get_covered_lines();
    let bp = analyzer.bb_coverage_basis_points(&targets, &covered);
    println!("bb coverage: {}.{:02}%", bp / 100, bp % 100);
    match analyzer.select_target(&covered) {
        Some(t) => println!(
            "next target: {}:bb{} ({} successor(s), lines {}:{:?})",
            t.function, t.bb_id, t.successor_count, t.file, t.lines
        ),
        None => println!("next target: none (frontier exhausted)"),
    }
}
