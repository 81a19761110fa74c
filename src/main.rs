//! elfc CLI
//!
//! Compiles a typed program (JSON) into a static x86-64 Linux executable.

use clap::{ArgAction, Parser, Subcommand};
use colored::Colorize;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use elfc::{compile_to_file, layout_program, CompileError, Program, Target};

#[derive(Parser)]
#[command(name = "elfc")]
#[command(version)]
#[command(about = "Native x86-64 ELF backend", long_about = None)]
struct Cli {
    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Compile a typed program to a native executable
    Compile {
        /// Input program (JSON)
        #[arg(value_name = "PROGRAM")]
        file: PathBuf,

        /// Output file path
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Output target
        #[arg(long, default_value = "elf64")]
        target: String,
    },

    /// Print the segment layout the executable would get
    Layout {
        /// Input program (JSON)
        #[arg(value_name = "PROGRAM")]
        file: PathBuf,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli.command {
        Commands::Compile {
            file,
            output,
            target,
        } => cmd_compile(file, output, target),
        Commands::Layout { file } => cmd_layout(file),
    }
}

fn init_tracing(verbose: u8) {
    let default = match verbose {
        0 => "warn",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
        .init();
}

/// Print a compilation error, code line in red, location dimmed
fn print_error(e: &CompileError) {
    for line in e.report().lines() {
        if line.starts_with("error") {
            eprintln!("{}", line.red().bold());
        } else {
            eprintln!("{}", line.dimmed());
        }
    }
}

fn load_program(file: &Path) -> Result<Program, ExitCode> {
    let source = match fs::read_to_string(file) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("{}: could not read '{}': {}", "error".red().bold(), file.display(), e);
            return Err(ExitCode::FAILURE);
        }
    };
    Program::from_json(&source).map_err(|e| {
        print_error(&e);
        ExitCode::FAILURE
    })
}

/// `prog.json` -> `prog`; an input without extension gets `.out`
fn default_output(file: &Path) -> PathBuf {
    let stem = file.with_extension("");
    if stem == file {
        file.with_extension("out")
    } else {
        stem
    }
}

fn cmd_compile(file: PathBuf, output: Option<PathBuf>, target: String) -> ExitCode {
    match target.parse::<Target>() {
        Ok(Target::Elf64) => {}
        Err(e) => {
            print_error(&e);
            return ExitCode::FAILURE;
        }
    }

    let program = match load_program(&file) {
        Ok(p) => p,
        Err(code) => return code,
    };

    let output_path = output.unwrap_or_else(|| default_output(&file));
    match compile_to_file(&program, &output_path) {
        Ok(()) => {
            println!(
                "{} {} -> {}",
                "Compiled".green().bold(),
                file.display(),
                output_path.display()
            );
            ExitCode::SUCCESS
        }
        Err(e) => {
            print_error(&e);
            ExitCode::FAILURE
        }
    }
}

fn cmd_layout(file: PathBuf) -> ExitCode {
    let program = match load_program(&file) {
        Ok(p) => p,
        Err(code) => return code,
    };

    match layout_program(&program) {
        Ok(layout) => {
            println!("{}", "Segments".cyan().bold());
            println!(
                "  text  offset {:#08x}  vaddr {:#010x}  size {:#x}  (r-x)",
                layout.code_offset, layout.code_vaddr, layout.code_size
            );
            println!(
                "  data  offset {:#08x}  vaddr {:#010x}  size {:#x}  mem {:#x}  (rw-)",
                layout.data_offset,
                layout.data_vaddr,
                layout.data_filesz(),
                layout.data_memsz()
            );
            println!(
                "  bss   vaddr {:#010x}  size {:#x}",
                layout.bss_vaddr, layout.bss_size
            );
            println!("  entry {:#010x}", layout.entry);
            ExitCode::SUCCESS
        }
        Err(e) => {
            print_error(&e);
            ExitCode::FAILURE
        }
    }
}
