use crate::module::{ModuleError, Pkcs11Module};
use pkcs11::types::{CKF_RW_SESSION, CKF_SERIAL_SESSION, CK_FLAGS, CK_SESSION_HANDLE, CK_SLOT_ID};
use slog::Logger;

/// Whether a session may create, modify or destroy objects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SessionMode {
    ReadOnly,
    ReadWrite,
}

impl SessionMode {
    fn flags(self) -> CK_FLAGS {
        match self {
            SessionMode::ReadOnly => CKF_SERIAL_SESSION,
            SessionMode::ReadWrite => CKF_RW_SESSION | CKF_SERIAL_SESSION,
        }
    }
}

/// An open session on one slot, logged out and closed when dropped.
///
/// Cleanup failures are logged and otherwise ignored, so they never replace the result of the
/// operation that used the session.
pub(crate) struct Session<'a> {
    module: &'a dyn Pkcs11Module,
    handle: CK_SESSION_HANDLE,
    logged_in: bool,
    logger: &'a Logger,
}

impl<'a> Session<'a> {
    pub(crate) fn open(
        module: &'a dyn Pkcs11Module,
        slot: CK_SLOT_ID,
        mode: SessionMode,
        logger: &'a Logger,
    ) -> Result<Self, ModuleError> {
        let handle = module.open_session(slot, mode.flags())?;
        slog::debug!(logger, "session opened"; "session" => handle, "mode" => ?mode);
        Ok(Self {
            module,
            handle,
            logged_in: false,
            logger,
        })
    }

    /// Logs in as the normal user.
    pub(crate) fn login(&mut self, pin: &str) -> Result<(), ModuleError> {
        self.module.login(self.handle, pin)?;
        self.logged_in = true;
        slog::debug!(self.logger, "logged in"; "session" => self.handle);
        Ok(())
    }

    pub(crate) fn handle(&self) -> CK_SESSION_HANDLE {
        self.handle
    }

    pub(crate) fn module(&self) -> &'a dyn Pkcs11Module {
        self.module
    }
}

impl Drop for Session<'_> {
    fn drop(&mut self) {
        if self.logged_in {
            match self.module.logout(self.handle) {
                Ok(()) => slog::debug!(self.logger, "logged out"; "session" => self.handle),
                Err(err) => {
                    slog::error!(self.logger, "logout failed"; "session" => self.handle, "error" => %err)
                }
            }
        }
        match self.module.close_session(self.handle) {
            Ok(()) => slog::debug!(self.logger, "session closed"; "session" => self.handle),
            Err(err) => {
                slog::error!(self.logger, "closing session failed"; "session" => self.handle, "error" => %err)
            }
        }
    }
}
