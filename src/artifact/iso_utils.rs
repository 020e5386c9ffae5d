//! Native ISO authoring tools and output checksums.
//!
//! genisoimage, mkisofs and xorriso (in `-as mkisofs` mode) share one
//! argument dialect; xorriso additionally takes `-joliet-long`.

use anyhow::Result;
use std::ffi::OsString;
use std::path::{Path, PathBuf};

use super::iso::BootLayout;
use crate::acquire::cache::{sha256_file, sidecar_path, write_checksum_file};
use crate::preflight::ToolId;
use crate::process::Cmd;

/// Argument list for `tool` authoring `tree` into `output`.
///
/// Paths in the boot layout are relative to `tree`, as the tools expect.
pub fn native_tool_args(
    tool: ToolId,
    tree: &Path,
    output: &Path,
    volume_id: &str,
    boot: &BootLayout,
) -> Vec<OsString> {
    let mut args: Vec<OsString> = Vec::new();
    if tool == ToolId::Xorriso {
        args.extend(["-as", "mkisofs"].map(OsString::from));
    }
    args.extend(["-r", "-V", volume_id, "-cache-inodes", "-J", "-l"].map(OsString::from));
    if tool == ToolId::Xorriso {
        args.push("-joliet-long".into());
    }
    args.push("-b".into());
    args.push(boot.bios_image.clone().into_os_string());
    args.push("-c".into());
    args.push(boot.catalog.clone().into_os_string());
    args.extend(
        [
            "-no-emul-boot",
            "-boot-load-size",
            "4",
            "-boot-info-table",
            "-eltorito-alt-boot",
            "-e",
        ]
        .map(OsString::from),
    );
    args.push(boot.efi_image.clone().into_os_string());
    args.push("-no-emul-boot".into());
    args.push("-o".into());
    args.push(output.as_os_str().to_os_string());
    args.push(tree.as_os_str().to_os_string());
    args
}

/// Run a native authoring tool.
pub fn run_native_tool(
    tool: ToolId,
    tree: &Path,
    output: &Path,
    volume_id: &str,
    boot: &BootLayout,
) -> Result<()> {
    Cmd::new(tool.command())
        .args(native_tool_args(tool, tree, output, volume_id, boot))
        .error_msg(format!(
            "{} failed. Install {}.",
            tool.command(),
            tool.package()
        ))
        .run()?;
    Ok(())
}

/// Write `<iso>.sha256` in manifest format. Returns the digest and the
/// sidecar path.
pub fn generate_iso_checksum(iso_path: &Path) -> Result<(String, PathBuf)> {
    let (digest, _) = sha256_file(iso_path)?;
    write_checksum_file(iso_path, &digest)?;

    let sidecar = sidecar_path(iso_path);
    log::info!("SHA256: {}...{}", &digest[..8], &digest[digest.len() - 8..]);
    log::info!("Wrote: {}", sidecar.display());
    Ok((digest, sidecar))
}
