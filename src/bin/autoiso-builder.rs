use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{bail, Context, Result};
use autoiso_builder::{config, BuildError, CancelToken, HttpMirror, Invocation, Pipeline, SystemProbe};

const EXIT_FAILURE: u8 = 1;
const EXIT_INTERRUPTED: u8 = 130;

fn usage() -> &'static str {
    "Usage:\n  autoiso-builder --overlay <user-data.yaml> [options]\n\n\
     Options:\n  \
     --version <X.Y[.Z]>   Ubuntu release (default 24.04.1)\n  \
     --mirror <url>        Release mirror base URL\n  \
     --output-dir <dir>    Where the finished image is written\n  \
     --cache-dir <dir>     Source image cache\n  \
     --profile <name>      Profile name used in the output file name\n  \
     --config <file>       TOML configuration file\n  \
     --skip-validation     Only check overlay syntax\n  \
     --no-cache            Always download the source image\n  \
     --no-verify           Do not verify the source image checksum\n\n\
     Credentials are read from AUTOINSTALL_USERNAME, AUTOINSTALL_PASSWORD,\n\
     AUTOINSTALL_SSH_KEY and AUTOINSTALL_ROOT_PASSWORD."
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp(None)
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let invocation = match parse_args(&args) {
        Ok(Some(invocation)) => invocation,
        Ok(None) => {
            println!("{}", usage());
            return ExitCode::SUCCESS;
        }
        Err(err) => {
            eprintln!("{err:#}");
            return ExitCode::from(EXIT_FAILURE);
        }
    };

    match build(&invocation) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => match err.downcast_ref::<BuildError>() {
            Some(BuildError::Cancelled) => {
                eprintln!("{err}");
                ExitCode::from(EXIT_INTERRUPTED)
            }
            Some(build_err) => {
                eprintln!("{build_err}");
                ExitCode::from(EXIT_FAILURE)
            }
            None => {
                eprintln!("{err:#}");
                ExitCode::from(EXIT_FAILURE)
            }
        },
    }
}

fn build(invocation: &Invocation) -> Result<()> {
    let cancel = CancelToken::new();
    let handler_token = cancel.clone();
    ctrlc::set_handler(move || {
        log::warn!("Interrupted; cleaning up");
        handler_token.cancel();
    })
    .context("Failed to install the interrupt handler")?;

    let config = config::resolve(invocation)?;
    log::info!(
        "Building {} from Ubuntu {} with overlay {}",
        config.profile,
        config.version,
        config.overlay_path.display()
    );

    let mirror = HttpMirror::new(config.download_timeout);
    let outcome = Pipeline::new(&config, &mirror, &SystemProbe, cancel).run()?;

    println!("{}", outcome.output.path.display());
    println!("sha256 {}", outcome.output.sha256);
    Ok(())
}

/// `Ok(None)` means help was requested.
fn parse_args(args: &[String]) -> Result<Option<Invocation>> {
    let mut invocation = Invocation::default();
    let mut overlay = None;
    let mut rest = args;

    loop {
        rest = match rest {
            [] => break,
            [flag, ..] if flag == "-h" || flag == "--help" => return Ok(None),
            [flag, value, tail @ ..] if flag == "--overlay" => {
                overlay = Some(PathBuf::from(value));
                tail
            }
            [flag, value, tail @ ..] if flag == "--version" => {
                invocation.version = Some(value.clone());
                tail
            }
            [flag, value, tail @ ..] if flag == "--mirror" => {
                invocation.mirror_url = Some(value.clone());
                tail
            }
            [flag, value, tail @ ..] if flag == "--output-dir" => {
                invocation.output_dir = Some(PathBuf::from(value));
                tail
            }
            [flag, value, tail @ ..] if flag == "--cache-dir" => {
                invocation.cache_dir = Some(PathBuf::from(value));
                tail
            }
            [flag, value, tail @ ..] if flag == "--profile" => {
                invocation.profile = Some(value.clone());
                tail
            }
            [flag, value, tail @ ..] if flag == "--config" => {
                invocation.config_file = Some(PathBuf::from(value));
                tail
            }
            [flag, tail @ ..] if flag == "--skip-validation" => {
                invocation.skip_validation = true;
                tail
            }
            [flag, tail @ ..] if flag == "--no-cache" => {
                invocation.no_cache = true;
                tail
            }
            [flag, tail @ ..] if flag == "--no-verify" => {
                invocation.verify_checksum = Some(false);
                tail
            }
            [other, ..] => bail!("Unexpected argument '{other}'\n\n{}", usage()),
        };
    }

    let Some(overlay) = overlay else {
        bail!("--overlay is required\n\n{}", usage());
    };
    invocation.overlay_path = overlay;
    Ok(Some(invocation))
}
