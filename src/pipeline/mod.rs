//! The end-to-end build.
//!
//! Detect backends, then acquire the source image while the overlay is
//! validated, unpack, inject, recompose. A [`SecureTeardown`] guard owns the
//! working tree and runs whatever the outcome.

use std::path::Path;
use std::thread;
use time::{Date, OffsetDateTime};

use crate::acquire::cache::ImageCache;
use crate::acquire::mirror::MirrorClient;
use crate::acquire::{Acquirer, SourceImage};
use crate::artifact::compose::Composer;
use crate::artifact::extract::extract_image;
use crate::artifact::iso::{volume_label, OutputImage};
use crate::cancel::CancelToken;
use crate::config::BuildConfig;
use crate::error::{BuildError, BuildResult};
use crate::overlay::credentials::CredentialSet;
use crate::overlay::inject::{inject, InjectionReport, NOCLOUD_DIR};
use crate::overlay::validate::{validate_overlay, ValidationOptions};
use crate::overlay::OverlayDocument;
use crate::preflight::{self, BackendSelection, HostProbe};
use crate::teardown::{SecureTeardown, TeardownReport};

/// Everything a successful build produced.
#[derive(Debug)]
pub struct BuildOutcome {
    pub selection: BackendSelection,
    pub source: SourceImage,
    pub injection: InjectionReport,
    pub output: OutputImage,
    pub teardown: TeardownReport,
}

pub struct Pipeline<'a> {
    config: &'a BuildConfig,
    mirror: &'a dyn MirrorClient,
    probe: &'a dyn HostProbe,
    cancel: CancelToken,
    today: Date,
}

impl<'a> Pipeline<'a> {
    pub fn new(
        config: &'a BuildConfig,
        mirror: &'a dyn MirrorClient,
        probe: &'a dyn HostProbe,
        cancel: CancelToken,
    ) -> Self {
        Self {
            config,
            mirror,
            probe,
            cancel,
            today: OffsetDateTime::now_utc().date(),
        }
    }

    /// Fix the date used in the volume label.
    pub fn with_date(mut self, today: Date) -> Self {
        self.today = today;
        self
    }

    pub fn run(&self) -> BuildResult<BuildOutcome> {
        let mut teardown = SecureTeardown::new();
        let result = self.run_stages(&mut teardown);
        let report = teardown.finish();
        if !report.is_clean() {
            log::warn!("Teardown finished with {} warning(s)", report.warnings.len());
        }

        let (selection, source, injection, output) = result?;
        Ok(BuildOutcome {
            selection,
            source,
            injection,
            output,
            teardown: report,
        })
    }

    fn run_stages(
        &self,
        teardown: &mut SecureTeardown,
    ) -> BuildResult<(BackendSelection, SourceImage, InjectionReport, OutputImage)> {
        let config = self.config;

        let selection = preflight::detect(&config.backend, self.probe)?;

        if let Some(max_age) = config.cache_max_age {
            match ImageCache::new(&config.cache_dir).evict_older_than(max_age) {
                Ok(0) => {}
                Ok(n) => log::info!("Evicted {n} stale cache file(s)"),
                Err(err) => log::warn!("Cache eviction failed: {err:#}"),
            }
        }

        let (source, doc) = self.acquire_and_validate();
        let doc = doc?;
        let source = source?;

        let tree = teardown
            .create_work_tree(&config.work_dir)
            .map_err(|e| BuildError::extraction(&source.cache_path, e))?;
        extract_image(&selection, &source.cache_path, &tree, &self.cancel)?;
        self.cancel.check()?;

        let label = volume_label(&config.profile, &config.version, self.today);
        let injection = self.inject(&tree, &doc, &label, teardown)?;
        self.cancel.check()?;

        let output_path = config.output_dir.join(format!("{label}.iso"));
        let output = Composer::new(&selection, &self.cancel).compose(&tree, &label, &output_path)?;
        log::info!("Built {} ({})", output.path.display(), output.sha256);

        Ok((selection, source, injection, output))
    }

    /// Acquisition on a scoped thread, validation on this one.
    fn acquire_and_validate(&self) -> (BuildResult<SourceImage>, BuildResult<OverlayDocument>) {
        let options = ValidationOptions {
            skip: self.config.skip_validation,
            strict_external: self.config.strict_external_validation,
        };
        let (config, mirror, cancel) = (self.config, self.mirror, self.cancel.clone());
        thread::scope(|scope| {
            let acquisition = scope.spawn(move || Acquirer::new(config, mirror, cancel).acquire());
            let doc = validate_overlay(&self.config.overlay_path, options, self.probe);
            if doc.is_err() {
                // No point finishing a download for an overlay that cannot be used.
                self.cancel.cancel();
            }
            let source = acquisition
                .join()
                .unwrap_or_else(|panic| std::panic::resume_unwind(panic));
            (source, doc)
        })
    }

    fn inject(
        &self,
        tree: &Path,
        doc: &OverlayDocument,
        label: &str,
        teardown: &mut SecureTeardown,
    ) -> BuildResult<InjectionReport> {
        let credentials = if doc.is_templated() {
            // Registered first so a partial write is shredded too.
            teardown.register_secret_file(tree.join(NOCLOUD_DIR).join("user-data"));
            Some(CredentialSet::from_env())
        } else {
            None
        };
        inject(tree, doc, credentials.as_ref(), label)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acquire::fake::FakeMirror;
    use crate::artifact::iso::BootLayout;
    use crate::artifact::iso9660::reader::{EntryKind, IsoReader};
    use crate::artifact::iso9660::writer::write_image;
    use crate::config::{resolve_with, ConfigFile, Invocation};
    use crate::overlay::credentials::{
        ENV_PASSWORD, ENV_ROOT_PASSWORD, ENV_SSH_KEY, ENV_USERNAME,
    };
    use std::fs;
    use std::path::PathBuf;
    use tempfile::TempDir;
    use time::Month;

    const MIRROR: &str = "https://mirror.test/ubuntu";
    const VERSION: &str = "24.04.1";
    const PASSWORD: &str = "Valid@Pass123!";
    const SSH_KEY: &str =
        "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIAECAwQFBgcICQoLDA0ODxAREhMUFRYXGBkaGxwdHh8g ops@laptop";

    const TEMPLATE: &str = r#"#cloud-config
autoinstall:
  version: 1
  identity:
    hostname: web01
    username: "${AUTOINSTALL_USERNAME}"
    password: "${AUTOINSTALL_PASSWORD}"
  ssh:
    install-server: true
    authorized-keys:
      - "${AUTOINSTALL_SSH_KEY}"
"#;

    /// A host with no root and no tools: software backends only.
    struct BareHost;

    impl HostProbe for BareHost {
        fn is_root(&self) -> bool {
            false
        }

        fn path_exists(&self, _path: &Path) -> bool {
            false
        }

        fn find_command(&self, _name: &str) -> Option<PathBuf> {
            None
        }
    }

    fn source_iso(temp: &TempDir) -> Vec<u8> {
        let src = temp.path().join("source-tree");
        for dir in ["isolinux", "boot/grub", ".disk", "casper"] {
            fs::create_dir_all(src.join(dir)).unwrap();
        }
        fs::write(src.join("isolinux/isolinux.bin"), vec![0x90; 4096]).unwrap();
        fs::write(
            src.join("isolinux/txt.cfg"),
            "label live\n  kernel /casper/vmlinuz\n  append initrd=/casper/initrd ---\n",
        )
        .unwrap();
        fs::write(src.join("boot/grub/efi.img"), vec![0xef; 6144]).unwrap();
        fs::write(
            src.join("boot/grub/grub.cfg"),
            "menuentry \"Install\" {\n\tlinux\t/casper/vmlinuz  ---\n}\n",
        )
        .unwrap();
        fs::write(src.join(".disk/info"), "Ubuntu-Server 24.04.1 LTS").unwrap();
        fs::write(src.join("casper/vmlinuz"), vec![0x4b; 50_000]).unwrap();

        let iso = temp.path().join("source.iso");
        let boot = BootLayout::detect(&src).unwrap();
        write_image(&src, &iso, "Ubuntu-Server 24.04.1", Some(&boot), &CancelToken::new())
            .unwrap();
        fs::read(iso).unwrap()
    }

    fn config(temp: &TempDir, overlay: &str) -> BuildConfig {
        let overlay_path = temp.path().join("server.yaml");
        fs::write(&overlay_path, overlay).unwrap();
        let file: ConfigFile = toml::from_str(&format!(
            "[image]\nmirror = \"{MIRROR}\"\narchive_mirror = \"{MIRROR}-old\"\n\
             [paths]\nwork_dir = \"{}\"\n\
             [download]\nattempts = 2\ndelay_secs = 0\n\
             [backend]\nextraction = \"software\"\ncomposition = \"software\"\n",
            temp.path().join("work").display()
        ))
        .unwrap();
        let inv = Invocation {
            version: Some(VERSION.into()),
            overlay_path,
            output_dir: Some(temp.path().join("out")),
            cache_dir: Some(temp.path().join("cache")),
            profile: Some("web".into()),
            ..Default::default()
        };
        resolve_with(&inv, file, |_| None).unwrap()
    }

    fn mirror(temp: &TempDir) -> FakeMirror {
        FakeMirror::new().with_release(
            MIRROR,
            VERSION,
            "ubuntu-24.04.1-live-server-amd64.iso",
            &source_iso(temp),
        )
    }

    fn date() -> Date {
        Date::from_calendar_date(2026, Month::March, 7).unwrap()
    }

    fn contains(haystack: &[u8], needle: &str) -> bool {
        haystack
            .windows(needle.len())
            .any(|w| w == needle.as_bytes())
    }

    #[test]
    fn templated_build_leaves_no_secrets() {
        let temp = TempDir::new().unwrap();
        let config = config(&temp, TEMPLATE);
        let mirror = mirror(&temp);

        temp_env::with_vars(
            [
                (ENV_USERNAME, Some("validuser")),
                (ENV_PASSWORD, Some(PASSWORD)),
                (ENV_SSH_KEY, Some(SSH_KEY)),
            ],
            || {
                let outcome = Pipeline::new(&config, &mirror, &BareHost, CancelToken::new())
                    .with_date(date())
                    .run()
                    .unwrap();

                let output = &outcome.output;
                assert_eq!(
                    output.path,
                    temp.path().join("out/web-ubuntu-24.04.1-20260307.iso")
                );
                assert_eq!(output.volume_label, "web-ubuntu-24.04.1-20260307");
                assert!(outcome.injection.templated);
                assert_eq!(outcome.injection.patched_boot_configs.len(), 2);

                // Environment cleared, tree shredded and removed.
                for var in [ENV_USERNAME, ENV_PASSWORD, ENV_SSH_KEY, ENV_ROOT_PASSWORD] {
                    assert!(std::env::var_os(var).is_none(), "{var} still set");
                }
                assert_eq!(outcome.teardown.shredded.len(), 1);
                assert!(!outcome.injection.user_data.exists());
                assert_eq!(fs::read_dir(temp.path().join("work")).unwrap().count(), 0);

                // Neither the image bytes nor any file in it carries plaintext.
                let bytes = fs::read(&output.path).unwrap();
                assert!(!contains(&bytes, PASSWORD));
                assert!(!contains(&bytes, SSH_KEY));
                assert!(contains(&bytes, "$6$"));

                let mut reader = IsoReader::open(&output.path).unwrap();
                let entries = reader.entries().unwrap();
                let user_data = entries
                    .iter()
                    .find(|e| e.path == Path::new("nocloud/user-data"))
                    .unwrap();
                let EntryKind::File { extents } = &user_data.kind else {
                    panic!("user-data is not a file");
                };
                let mut text = Vec::new();
                reader.copy_file(extents, &mut text).unwrap();
                let text = String::from_utf8(text).unwrap();
                assert!(text.contains("username: validuser"));
                assert!(!text.contains("ops@laptop"));
                assert!(entries.iter().any(|e| e.path == Path::new("nocloud/meta-data")));
            },
        );
    }

    #[test]
    fn invalid_overlay_fails_and_cleans_up() {
        let temp = TempDir::new().unwrap();
        let config = config(&temp, "identity: {hostname: web}\n");
        let mirror = mirror(&temp);

        temp_env::with_vars_unset([ENV_PASSWORD], || {
            let err = Pipeline::new(&config, &mirror, &BareHost, CancelToken::new())
                .run()
                .unwrap_err();
            assert_eq!(err.class(), "ValidationFailure");
        });
        assert!(!temp.path().join("out").exists());
        assert!(!temp.path().join("work").exists());
    }

    #[test]
    fn missing_credentials_fail_after_extraction() {
        let temp = TempDir::new().unwrap();
        let config = config(&temp, TEMPLATE);
        let mirror = mirror(&temp);

        temp_env::with_vars_unset([ENV_USERNAME, ENV_PASSWORD, ENV_SSH_KEY], || {
            let err = Pipeline::new(&config, &mirror, &BareHost, CancelToken::new())
                .run()
                .unwrap_err();
            assert_eq!(err.class(), "CredentialValidationFailure");
            assert!(err.to_string().contains("AUTOINSTALL_USERNAME"));
        });
        assert_eq!(fs::read_dir(temp.path().join("work")).unwrap().count(), 0);
        assert!(!temp.path().join("out").exists());
    }

    #[test]
    fn cancelled_build_reports_cancellation() {
        let temp = TempDir::new().unwrap();
        let config = config(&temp, "version: 1\nidentity: {hostname: web}\n");
        let mirror = mirror(&temp);
        let cancel = CancelToken::new();
        cancel.cancel();

        temp_env::with_vars_unset([ENV_PASSWORD], || {
            let err = Pipeline::new(&config, &mirror, &BareHost, cancel)
                .run()
                .unwrap_err();
            assert!(matches!(err, BuildError::Cancelled));
        });
    }

    #[test]
    fn forced_unavailable_backend_fails_before_network() {
        let temp = TempDir::new().unwrap();
        let mut config = config(&temp, "version: 1\nidentity: {hostname: web}\n");
        config.backend.software_fallback = false;
        let mirror = mirror(&temp);

        temp_env::with_vars_unset([ENV_PASSWORD], || {
            let err = Pipeline::new(&config, &mirror, &BareHost, CancelToken::new())
                .run()
                .unwrap_err();
            assert_eq!(err.class(), "BackendUnavailable");
        });
        assert_eq!(mirror.requests(), 0);
    }
}
