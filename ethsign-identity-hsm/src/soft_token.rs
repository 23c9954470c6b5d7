//! An in-memory [`Pkcs11Module`] holding secp256k1 keys, for tests.
//!
//! Objects survive `C_Finalize`, the way a token keeps its objects across library restarts.
use crate::manager::SECP256K1_EC_PARAMS;
use crate::module::{Attribute, Mechanism, ModuleError, Pkcs11Module};
use ethsign_types::Address;
use k256::ecdsa::signature::hazmat::PrehashSigner;
use k256::ecdsa::{Signature, SigningKey};
use pkcs11::types::{
    CKA_EC_POINT, CKA_LABEL, CKF_RW_SESSION, CKF_SERIAL_SESSION, CKK_EC,
    CKO_PRIVATE_KEY, CKO_PUBLIC_KEY, CKR_ATTRIBUTE_TYPE_INVALID, CKR_CRYPTOKI_ALREADY_INITIALIZED,
    CKR_CRYPTOKI_NOT_INITIALIZED, CKR_DATA_LEN_RANGE, CKR_DOMAIN_PARAMS_INVALID,
    CKR_FUNCTION_FAILED, CKR_KEY_HANDLE_INVALID, CKR_MECHANISM_INVALID, CKR_OBJECT_HANDLE_INVALID,
    CKR_OPERATION_ACTIVE, CKR_OPERATION_NOT_INITIALIZED, CKR_PIN_INCORRECT,
    CKR_SESSION_HANDLE_INVALID, CKR_SESSION_PARALLEL_NOT_SUPPORTED, CKR_SESSION_READ_ONLY,
    CKR_SLOT_ID_INVALID, CKR_USER_NOT_LOGGED_IN, CK_ATTRIBUTE_TYPE, CK_FLAGS, CK_OBJECT_HANDLE,
    CK_RV, CK_SESSION_HANDLE, CK_SLOT_ID, CK_ULONG,
};
use simple_asn1::{to_der, ASN1Block};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Mutex, MutexGuard};

fn fail<T>(rv: CK_RV) -> Result<T, ModuleError> {
    Err(ModuleError::ReturnValue(rv))
}

fn raw_value(attribute: &Attribute) -> Vec<u8> {
    match attribute {
        Attribute::Class(value) | Attribute::KeyType(value) => value.to_ne_bytes().to_vec(),
        Attribute::Token(flag)
        | Attribute::Private(flag)
        | Attribute::Sign(flag)
        | Attribute::Verify(flag)
        | Attribute::Derive(flag) => vec![u8::from(*flag)],
        Attribute::Label(bytes) | Attribute::Id(bytes) | Attribute::EcParams(bytes) => {
            bytes.clone()
        }
    }
}

#[derive(Debug)]
struct Object {
    slot: CK_SLOT_ID,
    attributes: HashMap<CK_ATTRIBUTE_TYPE, Vec<u8>>,
    key: Option<SigningKey>,
}

impl Object {
    fn new(slot: CK_SLOT_ID, template: &[Attribute], key: Option<SigningKey>) -> Self {
        let attributes = template
            .iter()
            .map(|attribute| (attribute.attribute_type(), raw_value(attribute)))
            .collect();
        Self {
            slot,
            attributes,
            key,
        }
    }

    fn matches(&self, template: &[Attribute]) -> bool {
        template.iter().all(|attribute| {
            self.attributes.get(&attribute.attribute_type()) == Some(&raw_value(attribute))
        })
    }
}

#[derive(Debug)]
struct SessionState {
    slot: CK_SLOT_ID,
    read_write: bool,
    logged_in: bool,
    search: Option<Vec<CK_OBJECT_HANDLE>>,
    signing_key: Option<CK_OBJECT_HANDLE>,
}

#[derive(Debug, Default)]
struct TokenState {
    initialized: bool,
    next_handle: CK_ULONG,
    sessions: HashMap<CK_SESSION_HANDLE, SessionState>,
    objects: BTreeMap<CK_OBJECT_HANDLE, Object>,
    opened_sessions: usize,
    closed_sessions: usize,
    fail_login: bool,
    high_s: bool,
    corrupt_signatures: bool,
}

impl TokenState {
    fn next_handle(&mut self) -> CK_ULONG {
        self.next_handle += 1;
        self.next_handle
    }

    fn session(&self, session: CK_SESSION_HANDLE) -> Result<&SessionState, ModuleError> {
        match self.sessions.get(&session) {
            Some(state) => Ok(state),
            None => fail(CKR_SESSION_HANDLE_INVALID),
        }
    }

    fn session_mut(
        &mut self,
        session: CK_SESSION_HANDLE,
    ) -> Result<&mut SessionState, ModuleError> {
        match self.sessions.get_mut(&session) {
            Some(state) => Ok(state),
            None => fail(CKR_SESSION_HANDLE_INVALID),
        }
    }

    /// The session, which must be logged in and, when `write` is set, read/write.
    fn user_session(
        &self,
        session: CK_SESSION_HANDLE,
        write: bool,
    ) -> Result<&SessionState, ModuleError> {
        let state = self.session(session)?;
        if !state.logged_in {
            return fail(CKR_USER_NOT_LOGGED_IN);
        }
        if write && !state.read_write {
            return fail(CKR_SESSION_READ_ONLY);
        }
        Ok(state)
    }

    fn object(
        &self,
        slot: CK_SLOT_ID,
        object: CK_OBJECT_HANDLE,
    ) -> Result<&Object, ModuleError> {
        match self.objects.get(&object) {
            Some(found) if found.slot == slot => Ok(found),
            _ => fail(CKR_OBJECT_HANDLE_INVALID),
        }
    }

    fn insert(&mut self, object: Object) -> CK_OBJECT_HANDLE {
        let handle = self.next_handle();
        self.objects.insert(handle, object);
        handle
    }

    fn insert_pair(
        &mut self,
        slot: CK_SLOT_ID,
        key: SigningKey,
        public_key_template: &[Attribute],
        private_key_template: &[Attribute],
    ) -> Result<(CK_OBJECT_HANDLE, CK_OBJECT_HANDLE), ModuleError> {
        let point = key.verifying_key().to_encoded_point(false);
        let ec_point = to_der(&ASN1Block::OctetString(0, point.as_bytes().to_vec()))
            .map_err(|_| ModuleError::ReturnValue(CKR_FUNCTION_FAILED))?;

        let mut public_key = Object::new(slot, public_key_template, None);
        public_key.attributes.insert(CKA_EC_POINT, ec_point);
        let private_key = Object::new(slot, private_key_template, Some(key));

        Ok((self.insert(public_key), self.insert(private_key)))
    }
}

/// A software token with a fixed set of slots sharing one user PIN.
///
/// Besides implementing [`Pkcs11Module`], it counts sessions and can be told to misbehave.
#[derive(Debug)]
pub struct SoftToken {
    slots: BTreeSet<CK_SLOT_ID>,
    pin: String,
    state: Mutex<TokenState>,
}

impl SoftToken {
    /// A token with the given slots, not yet initialized.
    pub fn new(slots: impl IntoIterator<Item = CK_SLOT_ID>, pin: impl Into<String>) -> Self {
        Self {
            slots: slots.into_iter().collect(),
            pin: pin.into(),
            state: Mutex::new(TokenState::default()),
        }
    }

    fn state(&self) -> Result<MutexGuard<'_, TokenState>, ModuleError> {
        self.state
            .lock()
            .map_err(|_| ModuleError::Library("soft token lock poisoned".to_string()))
    }

    fn initialized_state(&self) -> Result<MutexGuard<'_, TokenState>, ModuleError> {
        let state = self.state()?;
        if !state.initialized {
            return fail(CKR_CRYPTOKI_NOT_INITIALIZED);
        }
        Ok(state)
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut TokenState) -> T) -> T {
        let mut state = match self.state.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut state)
    }

    /// Stores `key` in `slot` as a pair labeled with its address. Imported pairs carry no
    /// `CKA_ID`.
    pub fn import_key(&self, slot: CK_SLOT_ID, key: SigningKey) -> Result<Address, ModuleError> {
        if !self.slots.contains(&slot) {
            return fail(CKR_SLOT_ID_INVALID);
        }
        let point = key.verifying_key().to_encoded_point(false);
        let address = Address::from_public_key(point.as_bytes())
            .map_err(|_| ModuleError::ReturnValue(CKR_FUNCTION_FAILED))?;
        let label = Attribute::Label(address.to_checksum_string().into_bytes());
        let public_key_template = [
            Attribute::Class(CKO_PUBLIC_KEY),
            Attribute::KeyType(CKK_EC),
            Attribute::EcParams(SECP256K1_EC_PARAMS.to_vec()),
            label.clone(),
        ];
        let private_key_template = [
            Attribute::Class(CKO_PRIVATE_KEY),
            Attribute::KeyType(CKK_EC),
            label,
        ];
        self.state()?
            .insert_pair(slot, key, &public_key_template, &private_key_template)?;
        Ok(address)
    }

    /// Overwrites the label of every object in `slot` labeled with `address`.
    pub fn relabel(&self, slot: CK_SLOT_ID, address: &Address, label: &[u8]) {
        let current = address.to_checksum_string().into_bytes();
        self.with_state(|state| {
            for object in state.objects.values_mut() {
                if object.slot == slot && object.attributes.get(&CKA_LABEL) == Some(&current) {
                    object.attributes.insert(CKA_LABEL, label.to_vec());
                }
            }
        })
    }

    /// Makes every login fail with `CKR_PIN_INCORRECT`.
    pub fn set_fail_login(&self, fail_login: bool) {
        self.with_state(|state| state.fail_login = fail_login)
    }

    /// Makes `C_Sign` return the high-S twin of each signature.
    pub fn set_high_s(&self, high_s: bool) {
        self.with_state(|state| state.high_s = high_s)
    }

    /// Makes `C_Sign` return signatures that do not verify against the signing key.
    pub fn set_corrupt_signatures(&self, corrupt: bool) {
        self.with_state(|state| state.corrupt_signatures = corrupt)
    }

    /// Number of sessions opened so far.
    pub fn opened_sessions(&self) -> usize {
        self.with_state(|state| state.opened_sessions)
    }

    /// Number of sessions closed so far.
    pub fn closed_sessions(&self) -> usize {
        self.with_state(|state| state.closed_sessions)
    }
}

fn high_s_twin(signature: &Signature) -> Result<Signature, ModuleError> {
    let (r, s) = signature.split_scalars();
    Signature::from_scalars(r.to_bytes(), (-s).to_bytes())
        .map_err(|_| ModuleError::ReturnValue(CKR_FUNCTION_FAILED))
}

impl Pkcs11Module for SoftToken {
    fn initialize(&self) -> Result<(), ModuleError> {
        let mut state = self.state()?;
        if state.initialized {
            return fail(CKR_CRYPTOKI_ALREADY_INITIALIZED);
        }
        state.initialized = true;
        Ok(())
    }

    fn finalize(&self) -> Result<(), ModuleError> {
        let mut state = self.initialized_state()?;
        state.sessions.clear();
        state.initialized = false;
        Ok(())
    }

    fn open_session(
        &self,
        slot: CK_SLOT_ID,
        flags: CK_FLAGS,
    ) -> Result<CK_SESSION_HANDLE, ModuleError> {
        let mut state = self.initialized_state()?;
        if !self.slots.contains(&slot) {
            return fail(CKR_SLOT_ID_INVALID);
        }
        if flags & CKF_SERIAL_SESSION == 0 {
            return fail(CKR_SESSION_PARALLEL_NOT_SUPPORTED);
        }
        let handle = state.next_handle();
        state.sessions.insert(
            handle,
            SessionState {
                slot,
                read_write: flags & CKF_RW_SESSION != 0,
                logged_in: false,
                search: None,
                signing_key: None,
            },
        );
        state.opened_sessions += 1;
        Ok(handle)
    }

    fn close_session(&self, session: CK_SESSION_HANDLE) -> Result<(), ModuleError> {
        let mut state = self.initialized_state()?;
        if state.sessions.remove(&session).is_none() {
            return fail(CKR_SESSION_HANDLE_INVALID);
        }
        state.closed_sessions += 1;
        Ok(())
    }

    fn login(&self, session: CK_SESSION_HANDLE, pin: &str) -> Result<(), ModuleError> {
        let mut state = self.initialized_state()?;
        let fail_login = state.fail_login;
        let session = state.session_mut(session)?;
        if fail_login || pin != self.pin {
            return fail(CKR_PIN_INCORRECT);
        }
        session.logged_in = true;
        Ok(())
    }

    fn logout(&self, session: CK_SESSION_HANDLE) -> Result<(), ModuleError> {
        let mut state = self.initialized_state()?;
        let session = state.session_mut(session)?;
        if !session.logged_in {
            return fail(CKR_USER_NOT_LOGGED_IN);
        }
        session.logged_in = false;
        Ok(())
    }

    fn generate_key_pair(
        &self,
        session: CK_SESSION_HANDLE,
        mechanism: Mechanism,
        public_key_template: &[Attribute],
        private_key_template: &[Attribute],
    ) -> Result<(CK_OBJECT_HANDLE, CK_OBJECT_HANDLE), ModuleError> {
        let mut state = self.initialized_state()?;
        let slot = state.user_session(session, true)?.slot;
        if mechanism != Mechanism::EcKeyPairGen {
            return fail(CKR_MECHANISM_INVALID);
        }
        let params = Attribute::EcParams(SECP256K1_EC_PARAMS.to_vec());
        if !public_key_template.contains(&params) {
            return fail(CKR_DOMAIN_PARAMS_INVALID);
        }
        let key = SigningKey::random(&mut rand::thread_rng());
        state.insert_pair(slot, key, public_key_template, private_key_template)
    }

    fn find_objects_init(
        &self,
        session: CK_SESSION_HANDLE,
        template: &[Attribute],
    ) -> Result<(), ModuleError> {
        let mut state = self.initialized_state()?;
        let slot = state.session(session)?.slot;
        let found = state
            .objects
            .iter()
            .filter(|(_, object)| object.slot == slot && object.matches(template))
            .map(|(handle, _)| *handle)
            .collect();
        let session = state.session_mut(session)?;
        if session.search.is_some() {
            return fail(CKR_OPERATION_ACTIVE);
        }
        session.search = Some(found);
        Ok(())
    }

    fn find_objects(
        &self,
        session: CK_SESSION_HANDLE,
        max_count: usize,
    ) -> Result<Vec<CK_OBJECT_HANDLE>, ModuleError> {
        let mut state = self.initialized_state()?;
        match state.session_mut(session)?.search.as_mut() {
            Some(remaining) => {
                let count = max_count.min(remaining.len());
                Ok(remaining.drain(..count).collect())
            }
            None => fail(CKR_OPERATION_NOT_INITIALIZED),
        }
    }

    fn find_objects_final(&self, session: CK_SESSION_HANDLE) -> Result<(), ModuleError> {
        let mut state = self.initialized_state()?;
        match state.session_mut(session)?.search.take() {
            Some(_) => Ok(()),
            None => fail(CKR_OPERATION_NOT_INITIALIZED),
        }
    }

    fn get_attribute_value(
        &self,
        session: CK_SESSION_HANDLE,
        object: CK_OBJECT_HANDLE,
        attribute_type: CK_ATTRIBUTE_TYPE,
    ) -> Result<Vec<u8>, ModuleError> {
        let state = self.initialized_state()?;
        let slot = state.session(session)?.slot;
        match state.object(slot, object)?.attributes.get(&attribute_type) {
            Some(value) => Ok(value.clone()),
            None => fail(CKR_ATTRIBUTE_TYPE_INVALID),
        }
    }

    fn set_attribute_value(
        &self,
        session: CK_SESSION_HANDLE,
        object: CK_OBJECT_HANDLE,
        attribute: &Attribute,
    ) -> Result<(), ModuleError> {
        let mut state = self.initialized_state()?;
        let slot = state.user_session(session, true)?.slot;
        state.object(slot, object)?;
        if let Some(found) = state.objects.get_mut(&object) {
            found
                .attributes
                .insert(attribute.attribute_type(), raw_value(attribute));
        }
        Ok(())
    }

    fn destroy_object(
        &self,
        session: CK_SESSION_HANDLE,
        object: CK_OBJECT_HANDLE,
    ) -> Result<(), ModuleError> {
        let mut state = self.initialized_state()?;
        let slot = state.user_session(session, true)?.slot;
        state.object(slot, object)?;
        state.objects.remove(&object);
        Ok(())
    }

    fn sign_init(
        &self,
        session: CK_SESSION_HANDLE,
        mechanism: Mechanism,
        key: CK_OBJECT_HANDLE,
    ) -> Result<(), ModuleError> {
        let mut state = self.initialized_state()?;
        let slot = state.user_session(session, false)?.slot;
        if mechanism != Mechanism::Ecdsa {
            return fail(CKR_MECHANISM_INVALID);
        }
        if state.object(slot, key)?.key.is_none() {
            return fail(CKR_KEY_HANDLE_INVALID);
        }
        let session = state.session_mut(session)?;
        if session.signing_key.is_some() {
            return fail(CKR_OPERATION_ACTIVE);
        }
        session.signing_key = Some(key);
        Ok(())
    }

    fn sign(&self, session: CK_SESSION_HANDLE, data: &[u8]) -> Result<Vec<u8>, ModuleError> {
        let mut state = self.initialized_state()?;
        let (slot, key) = {
            let session = state.session_mut(session)?;
            match session.signing_key.take() {
                Some(key) => (session.slot, key),
                None => return fail(CKR_OPERATION_NOT_INITIALIZED),
            }
        };
        let signing_key = match state.object(slot, key)?.key.as_ref() {
            Some(signing_key) => signing_key,
            None => return fail(CKR_KEY_HANDLE_INVALID),
        };
        let signature: Signature = signing_key
            .sign_prehash(data)
            .map_err(|_| ModuleError::ReturnValue(CKR_DATA_LEN_RANGE))?;
        let signature = if state.high_s {
            high_s_twin(&signature)?
        } else {
            signature
        };

        let mut raw = signature.to_bytes().to_vec();
        if state.corrupt_signatures {
            raw[0] ^= 0x01;
        }
        Ok(raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pkcs11::types::{CKA_CLASS, CKA_ID, CKA_KEY_TYPE};

    fn token() -> SoftToken {
        let token = SoftToken::new([0], "1234");
        token.initialize().unwrap();
        token
    }

    #[test]
    fn requires_initialization() {
        let token = SoftToken::new([0], "1234");
        assert_eq!(
            token.open_session(0, CKF_SERIAL_SESSION),
            Err(ModuleError::ReturnValue(CKR_CRYPTOKI_NOT_INITIALIZED))
        );
        token.initialize().unwrap();
        assert_eq!(
            token.initialize(),
            Err(ModuleError::ReturnValue(CKR_CRYPTOKI_ALREADY_INITIALIZED))
        );
    }

    #[test]
    fn read_only_sessions_cannot_write() {
        let token = token();
        let session = token.open_session(0, CKF_SERIAL_SESSION).unwrap();
        token.login(session, "1234").unwrap();
        let template = [Attribute::EcParams(SECP256K1_EC_PARAMS.to_vec())];
        assert_eq!(
            token.generate_key_pair(session, Mechanism::EcKeyPairGen, &template, &[]),
            Err(ModuleError::ReturnValue(CKR_SESSION_READ_ONLY))
        );
    }

    #[test]
    fn searches_in_batches() {
        let token = token();
        for byte in 0..3u8 {
            token
                .import_key(0, SigningKey::from_slice(&[byte + 1; 32]).unwrap())
                .unwrap();
        }
        let session = token.open_session(0, CKF_SERIAL_SESSION).unwrap();
        token
            .find_objects_init(session, &[Attribute::Class(CKO_PUBLIC_KEY)])
            .unwrap();
        assert_eq!(token.find_objects(session, 2).unwrap().len(), 2);
        assert_eq!(token.find_objects(session, 2).unwrap().len(), 1);
        assert!(token.find_objects(session, 2).unwrap().is_empty());
        token.find_objects_final(session).unwrap();
        assert_eq!(
            token.find_objects_final(session),
            Err(ModuleError::ReturnValue(CKR_OPERATION_NOT_INITIALIZED))
        );
    }

    #[test]
    fn imported_keys_have_no_id() {
        let token = token();
        token
            .import_key(0, SigningKey::from_slice(&[7; 32]).unwrap())
            .unwrap();
        let session = token.open_session(0, CKF_SERIAL_SESSION).unwrap();
        token.find_objects_init(session, &[]).unwrap();
        let objects = token.find_objects(session, 10).unwrap();
        token.find_objects_final(session).unwrap();
        assert_eq!(objects.len(), 2);
        for object in objects {
            assert_eq!(
                token.get_attribute_value(session, object, CKA_ID),
                Err(ModuleError::ReturnValue(CKR_ATTRIBUTE_TYPE_INVALID))
            );
            assert_eq!(
                token.get_attribute_value(session, object, CKA_KEY_TYPE),
                Ok(CKK_EC.to_ne_bytes().to_vec())
            );
            assert!(token.get_attribute_value(session, object, CKA_CLASS).is_ok());
        }
    }

    #[test]
    fn high_s_twin_has_the_other_s() {
        let key = SigningKey::from_slice(&[7; 32]).unwrap();
        let signature: Signature = key.sign_prehash(&[1; 32]).unwrap();
        let twin = high_s_twin(&signature).unwrap();
        assert_eq!(signature.r().to_bytes(), twin.r().to_bytes());
        assert_ne!(signature.s().to_bytes(), twin.s().to_bytes());
        assert_eq!(twin.normalize_s(), Some(signature));
    }
}
