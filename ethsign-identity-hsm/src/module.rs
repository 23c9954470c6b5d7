//! The PKCS#11 calls the signature manager relies on, as an object-safe trait.
use pkcs11::types::{
    CKA_CLASS, CKA_DERIVE, CKA_EC_PARAMS, CKA_ID, CKA_KEY_TYPE, CKA_LABEL, CKA_PRIVATE,
    CKA_SIGN, CKA_TOKEN, CKA_VERIFY, CK_ATTRIBUTE_TYPE, CK_FLAGS, CK_KEY_TYPE, CK_OBJECT_CLASS,
    CK_OBJECT_HANDLE, CK_RV, CK_SESSION_HANDLE, CK_SLOT_ID,
};
use thiserror::Error;

/// A failed PKCS#11 call.
#[derive(Error, Clone, Debug, Eq, PartialEq)]
pub enum ModuleError {
    /// The module returned something other than `CKR_OK`.
    #[error("PKCS#11 call returned {0:#x}")]
    ReturnValue(CK_RV),

    /// The library could not be loaded or used.
    #[error("PKCS#11 library error: {0}")]
    Library(String),
}

impl ModuleError {
    /// The PKCS#11 return value, when the module produced one.
    pub fn return_value(&self) -> Option<CK_RV> {
        match self {
            ModuleError::ReturnValue(rv) => Some(*rv),
            ModuleError::Library(_) => None,
        }
    }
}

/// A mechanism used by the signature manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Mechanism {
    /// `CKM_EC_KEY_PAIR_GEN`.
    EcKeyPairGen,
    /// `CKM_ECDSA`: raw ECDSA over a caller-supplied digest.
    Ecdsa,
}

/// An object attribute with its value, used in templates.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Attribute {
    /// `CKA_CLASS`.
    Class(CK_OBJECT_CLASS),
    /// `CKA_KEY_TYPE`.
    KeyType(CK_KEY_TYPE),
    /// `CKA_TOKEN`.
    Token(bool),
    /// `CKA_PRIVATE`.
    Private(bool),
    /// `CKA_SIGN`.
    Sign(bool),
    /// `CKA_VERIFY`.
    Verify(bool),
    /// `CKA_DERIVE`.
    Derive(bool),
    /// `CKA_LABEL`.
    Label(Vec<u8>),
    /// `CKA_ID`.
    Id(Vec<u8>),
    /// `CKA_EC_PARAMS`, the DER encoded curve.
    EcParams(Vec<u8>),
}

impl Attribute {
    /// The `CKA_*` type of this attribute.
    pub fn attribute_type(&self) -> CK_ATTRIBUTE_TYPE {
        match self {
            Attribute::Class(_) => CKA_CLASS,
            Attribute::KeyType(_) => CKA_KEY_TYPE,
            Attribute::Token(_) => CKA_TOKEN,
            Attribute::Private(_) => CKA_PRIVATE,
            Attribute::Sign(_) => CKA_SIGN,
            Attribute::Verify(_) => CKA_VERIFY,
            Attribute::Derive(_) => CKA_DERIVE,
            Attribute::Label(_) => CKA_LABEL,
            Attribute::Id(_) => CKA_ID,
            Attribute::EcParams(_) => CKA_EC_PARAMS,
        }
    }
}

/// The subset of the PKCS#11 (Cryptoki) API used to manage and use keys.
///
/// Calls map one to one to the `C_*` functions of the standard. Implementations must be usable
/// from several threads at once; sessions are never shared between threads by callers.
pub trait Pkcs11Module: Send + Sync {
    /// `C_Initialize`.
    fn initialize(&self) -> Result<(), ModuleError>;

    /// `C_Finalize`.
    fn finalize(&self) -> Result<(), ModuleError>;

    /// `C_OpenSession`.
    fn open_session(
        &self,
        slot: CK_SLOT_ID,
        flags: CK_FLAGS,
    ) -> Result<CK_SESSION_HANDLE, ModuleError>;

    /// `C_CloseSession`.
    fn close_session(&self, session: CK_SESSION_HANDLE) -> Result<(), ModuleError>;

    /// `C_Login` as `CKU_USER`.
    fn login(&self, session: CK_SESSION_HANDLE, pin: &str) -> Result<(), ModuleError>;

    /// `C_Logout`.
    fn logout(&self, session: CK_SESSION_HANDLE) -> Result<(), ModuleError>;

    /// `C_GenerateKeyPair`. Returns the public and private object handles, in that order.
    fn generate_key_pair(
        &self,
        session: CK_SESSION_HANDLE,
        mechanism: Mechanism,
        public_key_template: &[Attribute],
        private_key_template: &[Attribute],
    ) -> Result<(CK_OBJECT_HANDLE, CK_OBJECT_HANDLE), ModuleError>;

    /// `C_FindObjectsInit`.
    fn find_objects_init(
        &self,
        session: CK_SESSION_HANDLE,
        template: &[Attribute],
    ) -> Result<(), ModuleError>;

    /// `C_FindObjects`. An empty result means the search is exhausted.
    fn find_objects(
        &self,
        session: CK_SESSION_HANDLE,
        max_count: usize,
    ) -> Result<Vec<CK_OBJECT_HANDLE>, ModuleError>;

    /// `C_FindObjectsFinal`.
    fn find_objects_final(&self, session: CK_SESSION_HANDLE) -> Result<(), ModuleError>;

    /// `C_GetAttributeValue` for a single attribute, returning its raw value.
    fn get_attribute_value(
        &self,
        session: CK_SESSION_HANDLE,
        object: CK_OBJECT_HANDLE,
        attribute_type: CK_ATTRIBUTE_TYPE,
    ) -> Result<Vec<u8>, ModuleError>;

    /// `C_SetAttributeValue` for a single attribute.
    fn set_attribute_value(
        &self,
        session: CK_SESSION_HANDLE,
        object: CK_OBJECT_HANDLE,
        attribute: &Attribute,
    ) -> Result<(), ModuleError>;

    /// `C_DestroyObject`.
    fn destroy_object(
        &self,
        session: CK_SESSION_HANDLE,
        object: CK_OBJECT_HANDLE,
    ) -> Result<(), ModuleError>;

    /// `C_SignInit`.
    fn sign_init(
        &self,
        session: CK_SESSION_HANDLE,
        mechanism: Mechanism,
        key: CK_OBJECT_HANDLE,
    ) -> Result<(), ModuleError>;

    /// `C_Sign`.
    fn sign(&self, session: CK_SESSION_HANDLE, data: &[u8]) -> Result<Vec<u8>, ModuleError>;
}
