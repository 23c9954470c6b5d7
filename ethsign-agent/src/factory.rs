//! Ownership and lifecycle of the signature managers, one per module kind.
use crate::agent_error::{AgentError, ErrorKind, ResultExt};
use crate::config::{FactoryConfig, ModuleKind};
use crate::logging::discard_logger;
use ethsign_identity_hsm::{
    DigitalSignatureManager, Pkcs11Library, Pkcs11SignatureManager, ReturnCodeTable,
    SignatureManagerErrorKind,
};
use slog::Logger;
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};

enum ModuleSource {
    Library(PathBuf),
    Manager(Arc<dyn DigitalSignatureManager>),
}

/// A builder for a [`SignatureManagerFactory`].
pub struct FactoryBuilder {
    logger: Logger,
    modules: BTreeMap<ModuleKind, ModuleSource>,
    return_codes: ReturnCodeTable,
}

impl Default for FactoryBuilder {
    fn default() -> Self {
        Self {
            logger: discard_logger(),
            modules: BTreeMap::new(),
            return_codes: ReturnCodeTable::standard(),
        }
    }
}

impl FactoryBuilder {
    /// Set the logger lifecycle events are written to. Records are discarded by default.
    pub fn with_logger(self, logger: Logger) -> Self {
        FactoryBuilder { logger, ..self }
    }

    /// Back `kind` with the PKCS#11 library at `path`. The library is loaded and initialized by
    /// [`build`](Self::build).
    pub fn with_pkcs11_library<P: Into<PathBuf>>(mut self, kind: ModuleKind, path: P) -> Self {
        self.modules.insert(kind, ModuleSource::Library(path.into()));
        self
    }

    /// Back `kind` with an already constructed manager.
    pub fn with_signature_manager<M>(mut self, kind: ModuleKind, manager: M) -> Self
    where
        M: 'static + DigitalSignatureManager,
    {
        self.modules
            .insert(kind, ModuleSource::Manager(Arc::new(manager)));
        self
    }

    /// Set the table translating module return codes of the libraries added with
    /// [`with_pkcs11_library`](Self::with_pkcs11_library).
    pub fn with_return_code_table(self, return_codes: ReturnCodeTable) -> Self {
        FactoryBuilder {
            return_codes,
            ..self
        }
    }

    /// Load every library and open every manager.
    pub fn build(self) -> Result<SignatureManagerFactory, AgentError> {
        if self.modules.is_empty() {
            return Err(AgentError::new(
                ErrorKind::InvalidArgument,
                "no cryptographic module configured",
            ));
        }

        let return_codes = Arc::new(self.return_codes);
        let mut managers = BTreeMap::new();
        for (kind, source) in self.modules {
            let manager: Arc<dyn DigitalSignatureManager> = match source {
                ModuleSource::Manager(manager) => manager,
                ModuleSource::Library(path) => {
                    if !path.exists() {
                        return Err(AgentError::new(
                            ErrorKind::InvalidArgument,
                            format!(
                                "the PKCS#11 library '{}' of module {} does not exist",
                                path.display(),
                                kind
                            ),
                        ));
                    }
                    let library = Pkcs11Library::load(&path).context(
                        ErrorKind::Internal,
                        format!("unable to load the PKCS#11 library '{}'", path.display()),
                    )?;
                    Arc::new(Pkcs11SignatureManager::with_return_codes(
                        Arc::new(library),
                        return_codes.clone(),
                    ))
                }
            };
            open_manager(manager.as_ref(), kind, &self.logger)?;
            managers.insert(kind, manager);
        }

        Ok(SignatureManagerFactory {
            logger: self.logger,
            managers,
            lifecycle: Mutex::new(()),
        })
    }
}

impl fmt::Debug for FactoryBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FactoryBuilder")
            .field("modules", &self.modules.keys().collect::<Vec<_>>())
            .field("return_codes", &self.return_codes)
            .finish_non_exhaustive()
    }
}

/// Opens `manager`, tolerating a module that is already initialized.
fn open_manager(
    manager: &dyn DigitalSignatureManager,
    kind: ModuleKind,
    logger: &Logger,
) -> Result<(), AgentError> {
    match manager.open(logger) {
        Ok(()) => {
            slog::info!(logger, "module opened"; "module" => %kind);
            Ok(())
        }
        Err(err) if err.kind() == SignatureManagerErrorKind::AlreadyInitialized => {
            slog::debug!(logger, "module already open"; "module" => %kind);
            Ok(())
        }
        Err(err) => Err(AgentError::from(err)),
    }
}

/// Holds one [`DigitalSignatureManager`] per configured module kind for the life of the process.
///
/// [`create`](Self::create), [`close`](Self::close) and [`reset`](Self::reset) are serialized
/// with each other. Operations already running on a manager are not: resetting a module while
/// another thread signs with it is the caller's race to avoid.
pub struct SignatureManagerFactory {
    logger: Logger,
    managers: BTreeMap<ModuleKind, Arc<dyn DigitalSignatureManager>>,
    lifecycle: Mutex<()>,
}

impl SignatureManagerFactory {
    /// Start building a factory.
    pub fn builder() -> FactoryBuilder {
        FactoryBuilder::default()
    }

    /// A factory backed by the libraries named in `config`.
    pub fn from_config(config: &FactoryConfig, logger: Logger) -> Result<Self, AgentError> {
        config
            .modules
            .iter()
            .fold(Self::builder().with_logger(logger), |builder, (kind, path)| {
                builder.with_pkcs11_library(*kind, path.clone())
            })
            .build()
    }

    /// The module kinds this factory serves.
    pub fn module_kinds(&self) -> impl Iterator<Item = ModuleKind> + '_ {
        self.managers.keys().copied()
    }

    fn lock(&self) -> Result<MutexGuard<'_, ()>, AgentError> {
        self.lifecycle.lock().map_err(|_| {
            AgentError::new(ErrorKind::Internal, "the module lifecycle lock is poisoned")
        })
    }

    fn manager(&self, kind: ModuleKind) -> Result<&Arc<dyn DigitalSignatureManager>, AgentError> {
        self.managers.get(&kind).ok_or_else(|| {
            AgentError::new(
                ErrorKind::InvalidArgument,
                format!("unsupported module kind '{}'", kind),
            )
        })
    }

    /// The manager of `kind`, opened if it was closed.
    pub fn create(&self, kind: ModuleKind) -> Result<Arc<dyn DigitalSignatureManager>, AgentError> {
        let manager = self.manager(kind)?;
        let _guard = self.lock()?;
        open_manager(manager.as_ref(), kind, &self.logger)?;
        Ok(manager.clone())
    }

    /// Close every module. Each one is attempted; the first failure is returned.
    pub fn close(&self) -> Result<(), AgentError> {
        let _guard = self.lock()?;
        let mut first_error = None;
        for (kind, manager) in &self.managers {
            match manager.close(&self.logger) {
                Ok(()) => slog::info!(self.logger, "module closed"; "module" => %kind),
                Err(err) => {
                    slog::warn!(self.logger, "unable to close module"; "module" => %kind, "error" => %err);
                    first_error.get_or_insert(err);
                }
            }
        }
        match first_error {
            Some(err) => Err(AgentError::from(err)),
            None => Ok(()),
        }
    }

    /// Close and reopen the module of `kind`, so it sees slots created since it was opened.
    pub fn reset(&self, kind: ModuleKind) -> Result<(), AgentError> {
        let manager = self.manager(kind)?;
        let _guard = self.lock()?;
        if let Err(err) = manager.close(&self.logger) {
            slog::warn!(self.logger, "unable to close module before reopening it"; "module" => %kind, "error" => %err);
        }
        open_manager(manager.as_ref(), kind, &self.logger)?;
        slog::info!(self.logger, "module reset"; "module" => %kind);
        Ok(())
    }
}

impl fmt::Debug for SignatureManagerFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SignatureManagerFactory")
            .field("modules", &self.managers.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ethsign_identity_hsm::{SlotAccess, SoftToken};

    fn soft_token_factory() -> (Arc<SoftToken>, SignatureManagerFactory) {
        let token = Arc::new(SoftToken::new([0], "1234"));
        let factory = SignatureManagerFactory::builder()
            .with_signature_manager(
                ModuleKind::SoftHsm,
                Pkcs11SignatureManager::new(token.clone()),
            )
            .build()
            .expect("Failed to build the factory");
        (token, factory)
    }

    #[test]
    fn requires_a_module() {
        let err = SignatureManagerFactory::builder().build().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        let err = SignatureManagerFactory::from_config(&FactoryConfig::default(), discard_logger())
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }

    #[test]
    fn library_must_exist() {
        let dir = tempfile::tempdir().expect("Failed to create a temporary directory");
        let config = FactoryConfig::default()
            .with_module(ModuleKind::SoftHsm, dir.path().join("libsofthsm2.so"));
        let err = SignatureManagerFactory::from_config(&config, discard_logger()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }

    #[test]
    fn library_must_load() {
        let file = tempfile::NamedTempFile::new().expect("Failed to create a temporary file");
        let err = SignatureManagerFactory::builder()
            .with_pkcs11_library(ModuleKind::SoftHsm, file.path())
            .build()
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Internal);
    }

    #[test]
    fn build_opens_the_module() {
        let (token, factory) = soft_token_factory();
        assert_eq!(factory.module_kinds().collect::<Vec<_>>(), vec![ModuleKind::SoftHsm]);
        let manager = factory.create(ModuleKind::SoftHsm).unwrap();
        assert!(manager
            .is_alive(&SlotAccess::new("0", "1234"), &discard_logger())
            .unwrap());
        assert_eq!(token.opened_sessions(), 1);
    }

    #[test]
    fn close_then_create_reopens() {
        let (_token, factory) = soft_token_factory();
        factory.close().unwrap();
        let manager = factory.create(ModuleKind::SoftHsm).unwrap();
        assert!(manager
            .list_keys(&SlotAccess::new("0", "1234"), &discard_logger())
            .unwrap()
            .is_empty());
    }

    #[test]
    fn close_twice_reports_the_failure() {
        let (_token, factory) = soft_token_factory();
        factory.close().unwrap();
        assert_eq!(factory.close().unwrap_err().kind(), ErrorKind::Internal);
    }

    #[test]
    fn reset_keeps_keys() {
        let (_token, factory) = soft_token_factory();
        let access = SlotAccess::new("0", "1234");
        let manager = factory.create(ModuleKind::SoftHsm).unwrap();
        let address = manager.generate_key(&access, &discard_logger()).unwrap();

        factory.reset(ModuleKind::SoftHsm).unwrap();
        assert_eq!(
            manager.list_keys(&access, &discard_logger()).unwrap(),
            vec![address]
        );

        // Reset also recovers a closed module.
        factory.close().unwrap();
        factory.reset(ModuleKind::SoftHsm).unwrap();
        assert!(manager.is_alive(&access, &discard_logger()).unwrap());
    }
}
