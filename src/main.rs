use std::io;
use std::path::Path;

use tracing_subscriber::EnvFilter;

use evm2::host::HostInterface;
use evm2::wire::encode_image;
use evm2::{TranslateOptions, assemble_source, decode_image, disassemble, render_listing, translate};

#[derive(Debug, Clone, PartialEq, Eq, Default)]
struct CliConfig {
    program: Option<String>,
    payload: Option<String>,
    assemble: bool,
    disasm: bool,
    jit_dump: bool,
    help: bool,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_logging()?;

    let args: Vec<String> = std::env::args().skip(1).collect();
    let cli = parse_cli_args(&args).map_err(io::Error::other)?;
    if cli.help {
        print_usage();
        return Ok(());
    }
    let Some(program) = cli.program.as_deref() else {
        print_usage();
        return Err(io::Error::other("missing program path").into());
    };

    if cli.assemble {
        let Some(output) = cli.payload.as_deref() else {
            return Err(io::Error::other("missing assembler output path").into());
        };
        let source = std::fs::read_to_string(program)?;
        let image = assemble_source(&source)?;
        std::fs::write(output, encode_image(&image))?;
        return Ok(());
    }

    let bytes = std::fs::read(program)?;
    let image = decode_image(&bytes)?;

    if cli.disasm {
        let instructions = disassemble(&image.code);
        print!("{}", render_listing(&instructions));
        return Ok(());
    }

    if cli.jit_dump {
        let instructions = disassemble(&image.code);
        let translated = translate(
            &instructions,
            &HostInterface::native(),
            &TranslateOptions {
                payload_available: true,
            },
        )?;
        print!("{}", translated.render_words());
        return Ok(());
    }

    run(&image, cli.payload.as_deref().map(Path::new))
}

#[cfg(all(target_arch = "aarch64", any(target_os = "linux", target_os = "macos")))]
fn run(
    image: &evm2::ProgramImage,
    payload: Option<&Path>,
) -> Result<(), Box<dyn std::error::Error>> {
    use evm2::harness::{RunOutcome, run_image};

    let outcome = run_image(image, payload)?;
    match outcome {
        RunOutcome::Completed => {}
        RunOutcome::HardTimeout => tracing::error!("hard timeout, guest terminated"),
        RunOutcome::SetupFailure => tracing::error!("guest setup failed"),
        RunOutcome::SandboxFault => tracing::error!("sandbox memory fault caught"),
        RunOutcome::Signaled(signal) => tracing::error!("guest killed by signal {signal}"),
        RunOutcome::Unknown(code) => tracing::error!("guest exited with unexpected status {code}"),
    }
    std::process::exit(outcome.exit_code());
}

#[cfg(not(all(target_arch = "aarch64", any(target_os = "linux", target_os = "macos"))))]
fn run(
    _image: &evm2::ProgramImage,
    _payload: Option<&Path>,
) -> Result<(), Box<dyn std::error::Error>> {
    Err(io::Error::other("execution requires a 64-bit ARM Unix host").into())
}

fn init_logging() -> Result<(), Box<dyn std::error::Error>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(io::stderr)
        .compact()
        .try_init()
        .map_err(|err| io::Error::other(err.to_string()))?;
    Ok(())
}

fn parse_cli_args(args: &[String]) -> Result<CliConfig, String> {
    let mut cfg = CliConfig::default();

    for arg in args {
        match arg.as_str() {
            "-h" | "--help" => cfg.help = true,
            "--assemble" => cfg.assemble = true,
            "--disasm" => cfg.disasm = true,
            "--jit-dump" => cfg.jit_dump = true,
            value if value.starts_with('-') => {
                return Err(format!("unknown flag '{value}'"));
            }
            path if cfg.program.is_none() => cfg.program = Some(path.to_string()),
            path if cfg.payload.is_none() => cfg.payload = Some(path.to_string()),
            _ => return Err("too many positional arguments".to_string()),
        }
    }

    Ok(cfg)
}

fn print_usage() {
    println!("Usage:");
    println!("  evm2-run <program.evm> [payload.bin]");
    println!("  evm2-run --disasm <program.evm>");
    println!("  evm2-run --jit-dump <program.evm>");
    println!("  evm2-run --assemble <source.easm> <program.evm>");
}
