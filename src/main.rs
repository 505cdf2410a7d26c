//! `wcc`: compiles one source file to W16 assembly

mod args;

use anyhow::{Context, Result};
use args::Args;
use std::fs;
use std::io::Write;
use std::path::Path;
use std::process;
use tracing_subscriber::EnvFilter;
use wcc::compiler::{CompileOptions, Compiler};
use wcc::Error;

fn init_tracing() {
    let filter = EnvFilter::try_from_env("WCC_LOG").unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

/// Writes `contents` to `path`, removing whatever was written on failure
fn write_output(path: &Path, contents: &str) -> Result<()> {
    let written = fs::File::create(path).and_then(|mut f| {
        f.write_all(contents.as_bytes())?;
        f.flush()
    });
    if let Err(e) = written {
        let _ = fs::remove_file(path);
        return Err(e).with_context(|| format!("failed to write '{}'", path.display()));
    }
    Ok(())
}

/// Runs one compilation; `Ok(false)` when diagnostics were reported
fn run(args: &Args) -> Result<bool> {
    let source = fs::read_to_string(&args.input)
        .with_context(|| format!("failed to read '{}'", args.input.display()))?;
    let compiler = Compiler::new(CompileOptions {
        opt_level: args.opt_level,
        listing: args.listing.is_some(),
        dump_ir: args.dump_ir,
        file: args.input.display().to_string(),
    });

    if args.dump_tokens {
        return match compiler.tokens(&source) {
            Ok(text) => {
                print!("{}", text);
                Ok(true)
            }
            Err(e) => report(e),
        };
    }

    let out = match compiler.compile(&source) {
        Ok(out) => out,
        Err(e) => return report(e),
    };
    if let Some(dump) = &out.ir_dump {
        print!("{}", dump);
    }
    write_output(&args.output, &out.assembly)?;
    if let (Some(path), Some(listing)) = (&args.listing, &out.listing) {
        if let Err(e) = write_output(path, listing) {
            let _ = fs::remove_file(&args.output);
            return Err(e);
        }
    }
    tracing::info!(
        output = %args.output.display(),
        functions = out.function_count,
        code_words = out.code_words,
        "compiled"
    );
    Ok(true)
}

/// Prints diagnostics to stderr; only internal errors propagate
fn report(e: Error) -> Result<bool> {
    match e {
        Error::Failed(_) | Error::Lexical { .. } | Error::Syntax { .. } | Error::Semantic { .. } | Error::Codegen { .. } => {
            eprintln!("{}", e.render());
            Ok(false)
        }
        other => Err(other.into()),
    }
}

fn main() {
    init_tracing();
    let args = Args::parse();
    match run(&args) {
        Ok(true) => {}
        Ok(false) => process::exit(1),
        Err(e) => {
            eprintln!("{}: {:#}", args.program, e);
            process::exit(1);
        }
    }
}
