//! Credential staging
//!
//! rustls consumes parsed certificates and keys, but a context is always built
//! from a *staged* copy of an identity snapshot: exactly three artifacts (leaf
//! plus chain, private key, trust bundle) that live only for one context build
//! and are wiped on every exit path. Each `stage` call yields a fresh,
//! uniquely named set, so a rotation never overwrites something an in-flight
//! build is still reading.

use crate::cert;
use crate::config::{StagingConfig, StagingMode};
use crate::error::{Error, Result};
use crate::spiffe_id::SpiffeId;
use crate::svid::IdentityMaterial;
use crate::trust_bundle::BundleScope;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tempfile::TempDir;
use tracing::{debug, warn};
use zeroize::Zeroizing;

/// Materializes identity snapshots into TLS-consumable artifacts
pub trait CredentialStager: Send + Sync {
    /// Stage `material`, keeping only the roots of the trust domains in `scope`
    fn stage(&self, material: &IdentityMaterial, scope: &BundleScope) -> Result<StagedCredential>;
}

/// Pick the stager described by `config`
pub fn stager_for(config: &StagingConfig) -> Arc<dyn CredentialStager> {
    match config.mode {
        StagingMode::Memory => Arc::new(MemoryStager::new()),
        StagingMode::TempFiles => Arc::new(TempFileStager::new(config.dir.clone())),
    }
}

/// Stages into process memory; the key buffer is wiped when released
#[derive(Debug, Default)]
pub struct MemoryStager {
    next_id: AtomicU64,
}

impl MemoryStager {
    /// Create a memory stager
    pub fn new() -> Self {
        Self::default()
    }
}

impl CredentialStager for MemoryStager {
    fn stage(&self, material: &IdentityMaterial, scope: &BundleScope) -> Result<StagedCredential> {
        let staging_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let pems = StagedPems::render(material, scope);

        debug!(staging_id, spiffe_id = %material.spiffe_id(), "Staged credential in memory");

        Ok(StagedCredential {
            staging_id,
            spiffe_id: material.spiffe_id().clone(),
            artifacts: Some(Artifacts::Memory(pems)),
        })
    }
}

/// Stages into a private temporary directory per call
///
/// The directory is created `0700` and each file `0600`. On release every file
/// is overwritten with zeros and synced before it is unlinked.
#[derive(Debug, Default)]
pub struct TempFileStager {
    parent: Option<PathBuf>,
    next_id: AtomicU64,
}

impl TempFileStager {
    /// Create a stager writing under `parent`, or the system temp dir
    pub fn new(parent: Option<PathBuf>) -> Self {
        TempFileStager {
            parent,
            next_id: AtomicU64::new(0),
        }
    }

    fn create_dir(&self) -> io::Result<TempDir> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("spiffe-staged-");
        let dir = match &self.parent {
            Some(parent) => builder.tempdir_in(parent)?,
            None => builder.tempdir()?,
        };
        fs::set_permissions(dir.path(), fs::Permissions::from_mode(0o700))?;
        Ok(dir)
    }
}

impl CredentialStager for TempFileStager {
    fn stage(&self, material: &IdentityMaterial, scope: &BundleScope) -> Result<StagedCredential> {
        let staging_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let pems = StagedPems::render(material, scope);

        let dir = self
            .create_dir()
            .map_err(|e| Error::staging(format!("Failed to create staging directory: {}", e)))?;

        let prefix = format!("{}-{}", std::process::id(), staging_id);
        let paths = StagedPaths {
            cert_chain: dir.path().join(format!("{}-svid.pem", prefix)),
            private_key: dir.path().join(format!("{}-key.pem", prefix)),
            bundle: dir.path().join(format!("{}-bundle.pem", prefix)),
        };

        let staged = StagedCredential {
            staging_id,
            spiffe_id: material.spiffe_id().clone(),
            artifacts: Some(Artifacts::Files {
                dir,
                paths: paths.clone(),
            }),
        };

        // On a write failure `staged` is dropped, which removes whatever was written.
        write_private(&paths.cert_chain, pems.cert_chain.as_bytes())?;
        write_private(&paths.private_key, pems.private_key.as_bytes())?;
        write_private(&paths.bundle, pems.bundle.as_bytes())?;

        debug!(
            staging_id,
            spiffe_id = %material.spiffe_id(),
            dir = %paths.dir().display(),
            "Staged credential files"
        );

        Ok(staged)
    }
}

fn write_private(path: &Path, contents: &[u8]) -> Result<()> {
    let write = || -> io::Result<()> {
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(0o600)
            .open(path)?;
        file.write_all(contents)?;
        file.sync_all()
    };

    write().map_err(|e| Error::staging(format!("Failed to write {}: {}", path.display(), e)))
}

fn wipe_and_remove(path: &Path) -> io::Result<()> {
    let len = match fs::metadata(path) {
        Ok(meta) => meta.len(),
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e),
    };

    let mut file = OpenOptions::new().write(true).open(path)?;
    let zeros = vec![0u8; len as usize];
    file.write_all(&zeros)?;
    file.sync_all()?;
    drop(file);

    match fs::remove_file(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

struct StagedPems {
    cert_chain: String,
    private_key: Zeroizing<String>,
    bundle: String,
}

impl StagedPems {
    fn render(material: &IdentityMaterial, scope: &BundleScope) -> Self {
        StagedPems {
            cert_chain: cert::certificates_to_pem(material.cert_chain()),
            private_key: material.private_key().to_pem(),
            bundle: cert::certificates_to_pem(&material.trust_bundles().roots_for(scope)),
        }
    }
}

/// Locations of file-staged artifacts
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StagedPaths {
    /// Leaf followed by intermediates, PEM
    pub cert_chain: PathBuf,
    /// Private key, PEM
    pub private_key: PathBuf,
    /// Trust bundle roots, PEM
    pub bundle: PathBuf,
}

impl StagedPaths {
    /// Directory holding the three files
    pub fn dir(&self) -> &Path {
        self.cert_chain.parent().unwrap_or_else(|| Path::new("/"))
    }
}

enum Artifacts {
    Memory(StagedPems),
    Files {
        dir: TempDir,
        paths: StagedPaths,
    },
}

/// Credentials parsed back out of a staged artifact set
#[derive(Debug)]
pub struct LoadedCredential {
    /// Leaf followed by intermediates
    pub cert_chain: Vec<CertificateDer<'static>>,
    /// Private key for the leaf
    pub private_key: PrivateKeyDer<'static>,
    /// Trust bundle roots
    pub roots: Vec<CertificateDer<'static>>,
}

/// One staged copy of an identity snapshot
///
/// Released explicitly with [`release`](Self::release) or implicitly on drop.
pub struct StagedCredential {
    staging_id: u64,
    spiffe_id: SpiffeId,
    artifacts: Option<Artifacts>,
}

impl StagedCredential {
    /// Identifier unique per stager
    pub fn staging_id(&self) -> u64 {
        self.staging_id
    }

    /// SPIFFE ID of the staged identity
    pub fn spiffe_id(&self) -> &SpiffeId {
        &self.spiffe_id
    }

    /// Whether the artifacts are gone
    pub fn is_released(&self) -> bool {
        self.artifacts.is_none()
    }

    /// File locations, for file-staged credentials that are not released
    pub fn paths(&self) -> Option<&StagedPaths> {
        match &self.artifacts {
            Some(Artifacts::Files { paths, .. }) => Some(paths),
            _ => None,
        }
    }

    /// Parse the staged artifacts into rustls types
    pub fn load(&self) -> Result<LoadedCredential> {
        let (chain, key, bundle) = match &self.artifacts {
            None => return Err(Error::staging("Staged credential already released")),
            Some(Artifacts::Memory(pems)) => (
                pems.cert_chain.as_bytes().to_vec(),
                Zeroizing::new(pems.private_key.as_bytes().to_vec()),
                pems.bundle.as_bytes().to_vec(),
            ),
            Some(Artifacts::Files { paths, .. }) => (
                read_staged(&paths.cert_chain)?,
                Zeroizing::new(read_staged(&paths.private_key)?),
                read_staged(&paths.bundle)?,
            ),
        };

        let cert_chain = cert::certificates_from_pem(&chain)
            .map_err(|e| Error::InvalidMaterial(e.to_string()))?;
        if cert_chain.is_empty() {
            return Err(Error::InvalidMaterial(
                "Staged certificate chain is empty".into(),
            ));
        }

        let private_key = cert::private_key_from_pem(&key)
            .map_err(|_| Error::InvalidMaterial("Staged private key is unreadable".into()))?;

        let roots = cert::certificates_from_pem(&bundle)
            .map_err(|e| Error::InvalidTrustBundle(e.to_string()))?;

        Ok(LoadedCredential {
            cert_chain,
            private_key,
            roots,
        })
    }

    /// Wipe and remove every artifact
    ///
    /// Idempotent: releasing an already released credential succeeds.
    pub fn release(&mut self) -> Result<()> {
        let artifacts = match self.artifacts.take() {
            Some(artifacts) => artifacts,
            None => return Ok(()),
        };

        match artifacts {
            Artifacts::Memory(pems) => {
                // Key buffer is zeroized on drop.
                drop(pems);
            }
            Artifacts::Files { dir, paths } => {
                let mut first_error = None;
                for path in [&paths.private_key, &paths.cert_chain, &paths.bundle] {
                    if let Err(e) = wipe_and_remove(path) {
                        first_error.get_or_insert_with(|| {
                            Error::staging(format!("Failed to wipe {}: {}", path.display(), e))
                        });
                    }
                }

                if let Err(e) = dir.close() {
                    first_error.get_or_insert_with(|| {
                        Error::staging(format!("Failed to remove staging directory: {}", e))
                    });
                }

                if let Some(err) = first_error {
                    return Err(err);
                }
            }
        }

        debug!(staging_id = self.staging_id, "Released staged credential");
        Ok(())
    }
}

fn read_staged(path: &Path) -> Result<Vec<u8>> {
    fs::read(path).map_err(|e| Error::staging(format!("Failed to read {}: {}", path.display(), e)))
}

impl Drop for StagedCredential {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            warn!(staging_id = self.staging_id, error = %e, "Failed to release staged credential");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spiffe_id::TrustDomain;
    use crate::test_support::TestCa;
    use crate::trust_bundle::{TrustBundle, TrustBundleSet};

    fn material_with_partner() -> IdentityMaterial {
        let ca = TestCa::new("example.org");
        let partner = TestCa::new("partner.org");
        let leaf = ca.issue("spiffe://example.org/web");

        let bundles: TrustBundleSet = [
            TrustBundle::new(ca.trust_domain.clone(), vec![ca.cert.clone()]),
            TrustBundle::new(partner.trust_domain.clone(), vec![partner.cert.clone()]),
        ]
        .into_iter()
        .collect();

        IdentityMaterial::new(
            SpiffeId::parse("spiffe://example.org/web").unwrap(),
            vec![leaf.cert],
            crate::svid::PrivateKey::pkcs8(leaf.key_der).unwrap(),
            bundles,
        )
        .unwrap()
    }

    #[test]
    fn test_memory_stage_and_load() {
        let material = material_with_partner();
        let stager = MemoryStager::new();

        let mut staged = stager.stage(&material, &BundleScope::All).unwrap();
        assert!(staged.paths().is_none());
        assert_eq!(staged.spiffe_id(), material.spiffe_id());

        let loaded = staged.load().unwrap();
        assert_eq!(loaded.cert_chain, material.cert_chain());
        assert_eq!(loaded.private_key.secret_der(), material.private_key().der());
        assert_eq!(loaded.roots.len(), 2);

        staged.release().unwrap();
        assert!(staged.is_released());
        assert!(matches!(staged.load(), Err(Error::StagingFailure(_))));
    }

    #[test]
    fn test_bundle_scope_limits_roots() {
        let material = material_with_partner();
        let stager = MemoryStager::new();

        let scope = BundleScope::single(TrustDomain::new("partner.org").unwrap());
        let staged = stager.stage(&material, &scope).unwrap();
        let loaded = staged.load().unwrap();

        let partner_roots = material
            .trust_bundles()
            .get(&TrustDomain::new("partner.org").unwrap())
            .unwrap()
            .certificates()
            .to_vec();
        assert_eq!(loaded.roots, partner_roots);
    }

    #[test]
    fn test_temp_files_are_private_and_unique() {
        let parent = tempfile::tempdir().unwrap();
        let material = material_with_partner();
        let stager = TempFileStager::new(Some(parent.path().to_path_buf()));

        let first = stager.stage(&material, &BundleScope::All).unwrap();
        let second = stager.stage(&material, &BundleScope::All).unwrap();

        let a = first.paths().unwrap().clone();
        let b = second.paths().unwrap().clone();
        assert_ne!(a.dir(), b.dir());
        assert_ne!(a.private_key, b.private_key);
        assert!(a
            .private_key
            .file_name()
            .unwrap()
            .to_string_lossy()
            .ends_with("-key.pem"));

        let dir_mode = fs::metadata(a.dir()).unwrap().permissions().mode() & 0o777;
        assert_eq!(dir_mode, 0o700);
        for path in [&a.cert_chain, &a.private_key, &a.bundle] {
            let mode = fs::metadata(path).unwrap().permissions().mode() & 0o777;
            assert_eq!(mode, 0o600);
        }

        let loaded = first.load().unwrap();
        assert_eq!(loaded.cert_chain, material.cert_chain());
    }

    #[test]
    fn test_release_is_idempotent_and_leaves_nothing() {
        let parent = tempfile::tempdir().unwrap();
        let material = material_with_partner();
        let stager = TempFileStager::new(Some(parent.path().to_path_buf()));

        let mut staged = stager.stage(&material, &BundleScope::All).unwrap();
        let paths = staged.paths().unwrap().clone();

        staged.release().unwrap();
        staged.release().unwrap();

        assert!(!paths.private_key.exists());
        assert!(!paths.cert_chain.exists());
        assert!(!paths.bundle.exists());
        assert!(!paths.dir().exists());
        assert_eq!(fs::read_dir(parent.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_drop_releases_files() {
        let parent = tempfile::tempdir().unwrap();
        let material = material_with_partner();
        let stager = TempFileStager::new(Some(parent.path().to_path_buf()));

        let staged = stager.stage(&material, &BundleScope::All).unwrap();
        let dir = staged.paths().unwrap().dir().to_path_buf();
        drop(staged);

        assert!(!dir.exists());
    }

    #[test]
    fn test_release_tolerates_externally_removed_files() {
        let parent = tempfile::tempdir().unwrap();
        let material = material_with_partner();
        let stager = TempFileStager::new(Some(parent.path().to_path_buf()));

        let mut staged = stager.stage(&material, &BundleScope::All).unwrap();
        fs::remove_file(&staged.paths().unwrap().private_key).unwrap();

        staged.release().unwrap();
        assert_eq!(fs::read_dir(parent.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_stager_for_config() {
        let parent = tempfile::tempdir().unwrap();
        let material = material_with_partner();

        let memory = stager_for(&StagingConfig::default());
        assert!(memory
            .stage(&material, &BundleScope::All)
            .unwrap()
            .paths()
            .is_none());

        let files = stager_for(&StagingConfig {
            mode: StagingMode::TempFiles,
            dir: Some(parent.path().to_path_buf()),
        });
        assert!(files
            .stage(&material, &BundleScope::All)
            .unwrap()
            .paths()
            .is_some());
    }
}
