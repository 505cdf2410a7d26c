//! Command-line arguments of the `wcc` binary

use std::path::PathBuf;
use std::process;

/// Compiler command-line arguments
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Args {
    /// Name of the program
    pub program: String,
    /// Input source file
    pub input: PathBuf,
    /// Assembly output (defaults to the input path with a `.s` extension)
    pub output: PathBuf,
    /// Listing output, if requested
    pub listing: Option<PathBuf>,
    /// Optimization level
    pub opt_level: u8,
    /// Print the token stream as JSON lines and stop
    pub dump_tokens: bool,
    /// Print the optimized Prim listing
    pub dump_ir: bool,
}

struct Flag {
    names: &'static [&'static str],
    description: &'static str,
}

const FLAG_REGISTRY: &[Flag] = &[
    Flag {
        names: &["-o", "--output"],
        description: "FILE   write assembly to FILE (default: input with '.s' extension)",
    },
    Flag {
        names: &["-l", "--listing"],
        description: "FILE  write a listing with addresses and encoded words to FILE",
    },
    Flag {
        names: &["-O0"],
        description: "                disable the IR and machine-code optimizers",
    },
    Flag {
        names: &["--dump-tokens"],
        description: "        print the token stream as JSON lines and stop",
    },
    Flag {
        names: &["--dump-ir"],
        description: "            print the optimized IR of every function",
    },
    Flag {
        names: &["-h", "--help"],
        description: "            print this summary",
    },
];

impl Args {
    /// Parses `std::env::args()`, exiting with the usage text on error
    pub fn parse() -> Self {
        let mut args = std::env::args();
        let program = args.next().unwrap_or_else(|| "wcc".into());
        match Self::parse_from(&program, args) {
            Ok(Some(args)) => args,
            Ok(None) => {
                print_usage(&program);
                process::exit(0);
            }
            Err(msg) => {
                eprintln!("{}: {}", program, msg);
                print_usage(&program);
                process::exit(2);
            }
        }
    }

    /// Parses arguments after the program name; `Ok(None)` asks for help
    pub fn parse_from<I>(program: &str, args: I) -> Result<Option<Self>, String>
    where
        I: IntoIterator<Item = String>,
    {
        let mut args = args.into_iter();
        let mut input = None;
        let mut output = None;
        let mut listing = None;
        let mut opt_level = 1;
        let mut dump_tokens = false;
        let mut dump_ir = false;

        while let Some(arg) = args.next() {
            match arg.as_str() {
                "-o" | "--output" => {
                    let path = args.next().ok_or("missing file name after '-o'")?;
                    output = Some(PathBuf::from(path));
                }
                "-l" | "--listing" => {
                    let path = args.next().ok_or("missing file name after '-l'")?;
                    listing = Some(PathBuf::from(path));
                }
                "-O0" => opt_level = 0,
                "--dump-tokens" => dump_tokens = true,
                "--dump-ir" => dump_ir = true,
                "-h" | "--help" => return Ok(None),
                flag if flag.starts_with('-') && flag != "-" => {
                    return Err(format!("invalid flag '{}'", flag));
                }
                _ => {
                    if input.is_some() {
                        return Err(format!("unexpected argument '{}'", arg));
                    }
                    input = Some(PathBuf::from(arg));
                }
            }
        }

        let input: PathBuf = input.ok_or("no input file")?;
        let output = output.unwrap_or_else(|| input.with_extension("s"));
        Ok(Some(Args {
            program: program.to_string(),
            input,
            output,
            listing,
            opt_level,
            dump_tokens,
            dump_ir,
        }))
    }
}

/// Prints the usage summary to stderr
pub fn print_usage(program: &str) {
    eprintln!("usage:");
    eprintln!("      {} [options] <infile>", program);
    eprintln!("options:");
    for flag in FLAG_REGISTRY {
        eprintln!("   {}  {}", flag.names.join(", "), flag.description);
    }
    eprintln!("environment:");
    eprintln!("   WCC_LOG               tracing filter (default: warn)");
}
