//! [`Pkcs11Module`] backed by a vendor PKCS#11 shared library, through the `pkcs11` crate.
use crate::module::{Attribute, Mechanism, ModuleError, Pkcs11Module};
use pkcs11::types::{
    CKF_SERIAL_SESSION, CKM_ECDSA, CKM_EC_KEY_PAIR_GEN, CKR_ATTRIBUTE_TYPE_INVALID,
    CKR_CRYPTOKI_ALREADY_INITIALIZED, CKR_CRYPTOKI_NOT_INITIALIZED, CKR_OK, CKU_USER,
    CK_ATTRIBUTE, CK_ATTRIBUTE_TYPE, CK_FALSE, CK_FLAGS, CK_MECHANISM, CK_OBJECT_HANDLE,
    CK_SESSION_HANDLE, CK_SLOT_ID, CK_TRUE, CK_ULONG, CK_UNAVAILABLE_INFORMATION,
};
use pkcs11::Ctx;
use std::fmt;
use std::path::{Path, PathBuf};
use std::ptr;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

impl From<pkcs11::errors::Error> for ModuleError {
    fn from(err: pkcs11::errors::Error) -> Self {
        match err {
            pkcs11::errors::Error::Pkcs11(rv) => ModuleError::ReturnValue(rv),
            other => ModuleError::Library(other.to_string()),
        }
    }
}

struct LibraryState {
    ctx: Ctx,
    initialized: bool,
}

/// A loaded PKCS#11 library such as `libsofthsm2.so`.
///
/// `C_Initialize`/`C_Finalize` take the context exclusively; every other call shares it.
pub struct Pkcs11Library {
    path: PathBuf,
    state: RwLock<LibraryState>,
}

impl Pkcs11Library {
    /// Loads the library without initializing it.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ModuleError> {
        let path = path.as_ref().to_path_buf();
        let ctx = Ctx::new(&path)?;
        Ok(Self {
            path,
            state: RwLock::new(LibraryState {
                ctx,
                initialized: false,
            }),
        })
    }

    /// Path the library was loaded from.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn initialized(&self) -> Result<RwLockReadGuard<'_, LibraryState>, ModuleError> {
        let state = self
            .state
            .read()
            .map_err(|_| ModuleError::Library("PKCS#11 context lock poisoned".to_string()))?;
        if !state.initialized {
            return Err(ModuleError::ReturnValue(CKR_CRYPTOKI_NOT_INITIALIZED));
        }
        Ok(state)
    }

    fn exclusive(&self) -> Result<RwLockWriteGuard<'_, LibraryState>, ModuleError> {
        self.state
            .write()
            .map_err(|_| ModuleError::Library("PKCS#11 context lock poisoned".to_string()))
    }
}

impl fmt::Debug for Pkcs11Library {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pkcs11Library")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

fn ck_mechanism(mechanism: Mechanism) -> CK_MECHANISM {
    let mechanism = match mechanism {
        Mechanism::EcKeyPairGen => CKM_EC_KEY_PAIR_GEN,
        Mechanism::Ecdsa => CKM_ECDSA,
    };
    CK_MECHANISM {
        mechanism,
        pParameter: ptr::null_mut(),
        ulParameterLen: 0,
    }
}

// The returned attribute points into `attribute`, which must outlive it.
fn ck_attribute(attribute: &Attribute) -> CK_ATTRIBUTE {
    let ck_attribute = CK_ATTRIBUTE::new(attribute.attribute_type());
    match attribute {
        Attribute::Class(value) | Attribute::KeyType(value) => ck_attribute.with_ck_ulong(value),
        Attribute::Token(flag)
        | Attribute::Private(flag)
        | Attribute::Sign(flag)
        | Attribute::Verify(flag)
        | Attribute::Derive(flag) => {
            ck_attribute.with_bool(if *flag { &CK_TRUE } else { &CK_FALSE })
        }
        Attribute::Label(bytes) | Attribute::Id(bytes) | Attribute::EcParams(bytes) => {
            ck_attribute.with_bytes(bytes)
        }
    }
}

fn ck_template(template: &[Attribute]) -> Vec<CK_ATTRIBUTE> {
    template.iter().map(ck_attribute).collect()
}

impl Pkcs11Module for Pkcs11Library {
    fn initialize(&self) -> Result<(), ModuleError> {
        let mut state = self.exclusive()?;
        if state.initialized {
            return Err(ModuleError::ReturnValue(CKR_CRYPTOKI_ALREADY_INITIALIZED));
        }
        state.ctx.initialize(None)?;
        state.initialized = true;
        Ok(())
    }

    fn finalize(&self) -> Result<(), ModuleError> {
        let mut state = self.exclusive()?;
        if !state.initialized {
            return Err(ModuleError::ReturnValue(CKR_CRYPTOKI_NOT_INITIALIZED));
        }
        state.ctx.finalize()?;
        state.initialized = false;
        Ok(())
    }

    fn open_session(
        &self,
        slot: CK_SLOT_ID,
        flags: CK_FLAGS,
    ) -> Result<CK_SESSION_HANDLE, ModuleError> {
        let state = self.initialized()?;
        Ok(state
            .ctx
            .open_session(slot, flags | CKF_SERIAL_SESSION, None, None)?)
    }

    fn close_session(&self, session: CK_SESSION_HANDLE) -> Result<(), ModuleError> {
        Ok(self.initialized()?.ctx.close_session(session)?)
    }

    fn login(&self, session: CK_SESSION_HANDLE, pin: &str) -> Result<(), ModuleError> {
        Ok(self.initialized()?.ctx.login(session, CKU_USER, Some(pin))?)
    }

    fn logout(&self, session: CK_SESSION_HANDLE) -> Result<(), ModuleError> {
        Ok(self.initialized()?.ctx.logout(session)?)
    }

    fn generate_key_pair(
        &self,
        session: CK_SESSION_HANDLE,
        mechanism: Mechanism,
        public_key_template: &[Attribute],
        private_key_template: &[Attribute],
    ) -> Result<(CK_OBJECT_HANDLE, CK_OBJECT_HANDLE), ModuleError> {
        let state = self.initialized()?;
        let mechanism = ck_mechanism(mechanism);
        let public_key_template = ck_template(public_key_template);
        let private_key_template = ck_template(private_key_template);
        Ok(state.ctx.generate_key_pair(
            session,
            &mechanism,
            &public_key_template,
            &private_key_template,
        )?)
    }

    fn find_objects_init(
        &self,
        session: CK_SESSION_HANDLE,
        template: &[Attribute],
    ) -> Result<(), ModuleError> {
        let state = self.initialized()?;
        let template = ck_template(template);
        Ok(state.ctx.find_objects_init(session, &template)?)
    }

    fn find_objects(
        &self,
        session: CK_SESSION_HANDLE,
        max_count: usize,
    ) -> Result<Vec<CK_OBJECT_HANDLE>, ModuleError> {
        let state = self.initialized()?;
        Ok(state.ctx.find_objects(session, max_count as CK_ULONG)?)
    }

    fn find_objects_final(&self, session: CK_SESSION_HANDLE) -> Result<(), ModuleError> {
        Ok(self.initialized()?.ctx.find_objects_final(session)?)
    }

    fn get_attribute_value(
        &self,
        session: CK_SESSION_HANDLE,
        object: CK_OBJECT_HANDLE,
        attribute_type: CK_ATTRIBUTE_TYPE,
    ) -> Result<Vec<u8>, ModuleError> {
        let state = self.initialized()?;

        // First call sizes the value, second call fills it.
        let mut length_template = vec![CK_ATTRIBUTE::new(attribute_type)];
        let (rv, lengths) = state
            .ctx
            .get_attribute_value(session, object, &mut length_template)?;
        if rv != CKR_OK {
            return Err(ModuleError::ReturnValue(rv));
        }
        let length = lengths
            .first()
            .map(|attribute| attribute.ulValueLen)
            .filter(|length| *length != CK_UNAVAILABLE_INFORMATION)
            .ok_or(ModuleError::ReturnValue(CKR_ATTRIBUTE_TYPE_INVALID))?;

        let value = vec![0u8; length as usize];
        let mut value_template =
            vec![CK_ATTRIBUTE::new(attribute_type).with_bytes(value.as_slice())];
        let (rv, _) = state
            .ctx
            .get_attribute_value(session, object, &mut value_template)?;
        if rv != CKR_OK {
            return Err(ModuleError::ReturnValue(rv));
        }
        Ok(value)
    }

    fn set_attribute_value(
        &self,
        session: CK_SESSION_HANDLE,
        object: CK_OBJECT_HANDLE,
        attribute: &Attribute,
    ) -> Result<(), ModuleError> {
        let state = self.initialized()?;
        let template = [ck_attribute(attribute)];
        Ok(state.ctx.set_attribute_value(session, object, &template)?)
    }

    fn destroy_object(
        &self,
        session: CK_SESSION_HANDLE,
        object: CK_OBJECT_HANDLE,
    ) -> Result<(), ModuleError> {
        Ok(self.initialized()?.ctx.destroy_object(session, object)?)
    }

    fn sign_init(
        &self,
        session: CK_SESSION_HANDLE,
        mechanism: Mechanism,
        key: CK_OBJECT_HANDLE,
    ) -> Result<(), ModuleError> {
        let state = self.initialized()?;
        let mechanism = ck_mechanism(mechanism);
        Ok(state.ctx.sign_init(session, &mechanism, key)?)
    }

    fn sign(&self, session: CK_SESSION_HANDLE, data: &[u8]) -> Result<Vec<u8>, ModuleError> {
        Ok(self.initialized()?.ctx.sign(session, data)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pkcs11::types::{CKA_LABEL, CKR_PIN_INCORRECT};

    #[test]
    fn converts_pkcs11_errors() {
        assert_eq!(
            ModuleError::from(pkcs11::errors::Error::Pkcs11(CKR_PIN_INCORRECT)),
            ModuleError::ReturnValue(CKR_PIN_INCORRECT)
        );
        assert!(matches!(
            ModuleError::from(pkcs11::errors::Error::Module("module not initialized")),
            ModuleError::Library(_)
        ));
    }

    #[test]
    fn label_attribute_points_at_its_bytes() {
        let label = Attribute::Label(b"0xa2c16184fA76cD6D16685900292683dF905e4Bf2".to_vec());
        let ck = ck_attribute(&label);
        assert_eq!(ck.attrType, CKA_LABEL);
        assert_eq!(ck.ulValueLen, 42);
    }

    #[test]
    fn missing_library_fails_to_load() {
        assert!(Pkcs11Library::load("/nonexistent/libpkcs11-missing.so").is_err());
    }
}
