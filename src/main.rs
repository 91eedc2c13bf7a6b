//! pasc compiler
//!
//! Compiles a small Pascal dialect to x86-64 NASM assembly.

mod backend;
mod driver;
mod feedback;
mod frontend;
mod types;
mod utils;

use std::fs;
use std::path::{Path, PathBuf};
use std::process;

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};

use feedback::{CompilationFeedback, ErrorReport};
use utils::Error;

/// pasc compiler
#[derive(Parser, Debug)]
#[command(name = "pasc")]
#[command(author = "Z1529")]
#[command(version = "0.1.0")]
#[command(about = "pasc - A Pascal-like language compiler emitting x86-64 NASM assembly")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Input source file (.pas)
    #[arg(value_name = "FILE")]
    input: Option<PathBuf>,

    /// Output assembly file
    #[arg(short, long, value_name = "FILE")]
    output: Option<PathBuf>,

    /// Assemble and link the output into an executable
    #[arg(long)]
    link: bool,

    /// How diagnostics are reported
    #[arg(long, value_enum, default_value = "human", global = true)]
    message_format: MessageFormat,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Compile a source file
    Build {
        /// Input source file
        input: PathBuf,

        /// Output assembly file
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Assemble and link the output into an executable
        #[arg(long)]
        link: bool,
    },
    /// Check a source file for errors
    Check {
        /// Input source file
        input: PathBuf,
    },
    /// Dump the token stream of a source file
    Tokens {
        /// Input source file
        input: PathBuf,

        /// One JSON object per token
        #[arg(long)]
        json: bool,
    },
    /// Print the analyzed tree and the scope tables of a source file
    Tree {
        /// Input source file
        input: PathBuf,
    },
    /// Print version information
    Version,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum MessageFormat {
    Human,
    Json,
}

impl Cli {
    fn input_path(&self) -> Option<&Path> {
        match &self.command {
            Some(Commands::Build { input, .. })
            | Some(Commands::Check { input })
            | Some(Commands::Tokens { input, .. })
            | Some(Commands::Tree { input }) => Some(input.as_path()),
            Some(Commands::Version) => None,
            None => self.input.as_deref(),
        }
    }
}

fn main() {
    env_logger::init();

    let cli = Cli::parse();

    if let Err(err) = run(&cli) {
        let file = cli
            .input_path()
            .map(|path| path.display().to_string())
            .unwrap_or_default();
        process::exit(report(&err, &file, cli.message_format));
    }
}

fn run(cli: &Cli) -> anyhow::Result<()> {
    match &cli.command {
        Some(Commands::Build { input, output, link }) => {
            compile_file(input, output.clone(), *link, cli.message_format)
        }
        Some(Commands::Check { input }) => check_file(input, cli.message_format),
        Some(Commands::Tokens { input, json }) => dump_tokens(input, *json),
        Some(Commands::Tree { input }) => {
            let source = read_source(input)?;
            print!("{}", driver::dump_tree(&source)?);
            Ok(())
        }
        Some(Commands::Version) => {
            println!("pasc 0.1.0");
            println!("Pascal-like language compiler (x86-64 NASM)");
            println!("License: Apache-2.0");
            Ok(())
        }
        None => match &cli.input {
            Some(input) => compile_file(input, cli.output.clone(), cli.link, cli.message_format),
            None => {
                eprintln!("Error: No input file specified");
                eprintln!("Usage: pasc <FILE> or pasc build <FILE>");
                process::exit(1);
            }
        },
    }
}

fn read_source(input: &Path) -> anyhow::Result<String> {
    let source = fs::read_to_string(input)
        .map_err(Error::from)
        .with_context(|| format!("could not read {}", input.display()))?;
    Ok(source)
}

/// Compile a source file to `.asm`, optionally linking it
fn compile_file(
    input: &Path,
    output: Option<PathBuf>,
    link: bool,
    format: MessageFormat,
) -> anyhow::Result<()> {
    let source = read_source(input)?;
    let (asm, stats) = driver::compile_with_stats(&source)?;

    let asm_path = output.unwrap_or_else(|| input.with_extension("asm"));
    fs::write(&asm_path, &asm)
        .map_err(Error::from)
        .with_context(|| format!("could not write {}", asm_path.display()))?;
    log::info!("wrote {} ({} lines)", asm_path.display(), stats.asm_lines);

    let exe_path = asm_path.with_extension("");
    if link {
        driver::link(&asm_path, &exe_path)?;
    }

    match format {
        MessageFormat::Json => {
            let feedback = CompilationFeedback::success(input.display().to_string(), stats);
            println!("{}", feedback.to_json());
        }
        MessageFormat::Human => {
            println!("Compiled {} -> {}", input.display(), asm_path.display());
            if link {
                println!("Linked {}", exe_path.display());
            }
        }
    }
    Ok(())
}

/// Check a source file for errors without generating code
fn check_file(input: &Path, format: MessageFormat) -> anyhow::Result<()> {
    let source = read_source(input)?;
    let program = driver::check_source(&source)?;

    match format {
        MessageFormat::Json => {
            let stats = feedback::CompilationStats {
                routine_count: program.routines.len(),
                type_count: program.types.len(),
                loc: source.lines().count(),
                asm_lines: 0,
            };
            let feedback = CompilationFeedback::success(input.display().to_string(), stats);
            println!("{}", feedback.to_json());
        }
        MessageFormat::Human => println!("No errors found in {}", input.display()),
    }
    Ok(())
}

fn dump_tokens(input: &Path, json: bool) -> anyhow::Result<()> {
    let source = read_source(input)?;
    for token in driver::tokenize_source(&source)? {
        if json {
            println!("{}", serde_json::to_string(&token)?);
        } else {
            println!(
                "{}\t{}\t{:?}\t{:?}",
                token.span.line, token.span.column, token.kind, token.text
            );
        }
    }
    Ok(())
}

/// Print a failure and pick the exit status: 1 for errors in the program,
/// 2 for internal compiler errors, 3 for I/O and tool failures
fn report(err: &anyhow::Error, file: &str, format: MessageFormat) -> i32 {
    let Some(error) = err.downcast_ref::<Error>() else {
        eprintln!("error: {:#}", err);
        return 3;
    };

    match format {
        MessageFormat::Json => {
            println!("{}", CompilationFeedback::failure(file.to_string(), error).to_json());
        }
        MessageFormat::Human => match error {
            Error::Io(_) => eprintln!("error: {:#}", err),
            _ => eprintln!("{}", ErrorReport::from_error(error, file).to_human()),
        },
    }

    match error {
        Error::Io(_) => 3,
        _ if error.is_internal() => 2,
        _ => 1,
    }
}
