//! Key lifecycle and raw signing against a PKCS#11 module.
use crate::error::{ReturnCodeTable, SignatureManagerError, SignatureManagerErrorKind};
use crate::module::{Attribute, Mechanism, ModuleError, Pkcs11Module};
use crate::session::{Session, SessionMode};
use ethsign_types::{Address, AddressError};
use k256::elliptic_curve::sec1::ToEncodedPoint;
use pkcs11::types::{
    CKA_EC_POINT, CKA_ID, CKA_LABEL, CKK_EC, CKO_PRIVATE_KEY, CKO_PUBLIC_KEY, CK_OBJECT_HANDLE,
    CK_SLOT_ID,
};
use simple_asn1::{from_der, ASN1Block, ASN1DecodeErr};
use slog::Logger;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use time::OffsetDateTime;

/// DER encoding of the secp256k1 curve OID, 1.3.132.0.10.
pub(crate) const SECP256K1_EC_PARAMS: &[u8; 7] = b"\x06\x05\x2b\x81\x04\x00\x0a";

const FIND_BATCH_SIZE: usize = 10_000;

/// The slot to work on and the user PIN that unlocks it.
#[derive(Clone, PartialEq, Eq)]
pub struct SlotAccess {
    slot: String,
    pin: String,
}

impl SlotAccess {
    /// `slot` is the decimal slot identifier.
    pub fn new(slot: impl Into<String>, pin: impl Into<String>) -> Self {
        Self {
            slot: slot.into(),
            pin: pin.into(),
        }
    }

    /// The slot identifier, as given.
    pub fn slot(&self) -> &str {
        &self.slot
    }

    /// The user PIN.
    pub fn pin(&self) -> &str {
        &self.pin
    }
}

impl fmt::Debug for SlotAccess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SlotAccess")
            .field("slot", &self.slot)
            .field("pin", &"<redacted>")
            .finish()
    }
}

/// Generates, lists, removes and uses secp256k1 key pairs held by a cryptographic module.
///
/// Every call other than [`open`](Self::open) and [`close`](Self::close) runs in its own
/// session: opened, logged into with the PIN, and logged out and closed again before the call
/// returns, whatever the outcome. No session outlives a call.
pub trait DigitalSignatureManager: Send + Sync {
    /// Initializes the module.
    fn open(&self, logger: &Logger) -> Result<(), SignatureManagerError>;

    /// Finalizes the module.
    fn close(&self, logger: &Logger) -> Result<(), SignatureManagerError>;

    /// Generates a key pair and returns its address. Both halves are labeled with the
    /// checksummed address.
    fn generate_key(
        &self,
        access: &SlotAccess,
        logger: &Logger,
    ) -> Result<Address, SignatureManagerError>;

    /// Destroys the key pair labeled with `address`.
    fn remove_key(
        &self,
        access: &SlotAccess,
        address: &Address,
        logger: &Logger,
    ) -> Result<(), SignatureManagerError>;

    /// The addresses of the stored key pairs, oldest first.
    fn list_keys(
        &self,
        access: &SlotAccess,
        logger: &Logger,
    ) -> Result<Vec<Address>, SignatureManagerError>;

    /// Signs `digest` as is with the private key of `address`, returning `r || s`.
    fn sign(
        &self,
        access: &SlotAccess,
        address: &Address,
        digest: &[u8],
        logger: &Logger,
    ) -> Result<Vec<u8>, SignatureManagerError>;

    /// Whether a session can be opened on the slot and logged into.
    fn is_alive(&self, access: &SlotAccess, logger: &Logger) -> Result<bool, SignatureManagerError>;
}

#[derive(Error, Debug)]
enum EcPointError {
    #[error("malformed DER: {0}")]
    Der(ASN1DecodeErr),

    #[error("the EC point is not an octet string")]
    NotOctetString,

    #[error("the EC point is not on secp256k1")]
    NotOnCurve,

    #[error(transparent)]
    Address(#[from] AddressError),
}

/// Derives the address from a `CKA_EC_POINT` value: a DER octet string wrapping a SEC1 point,
/// compressed or not.
fn address_from_ec_point(ec_point: &[u8]) -> Result<Address, EcPointError> {
    let blocks = from_der(ec_point).map_err(EcPointError::Der)?;
    let point = match blocks.first() {
        Some(ASN1Block::OctetString(_, point)) => point,
        _ => return Err(EcPointError::NotOctetString),
    };
    let public_key =
        k256::PublicKey::from_sec1_bytes(point).map_err(|_| EcPointError::NotOnCurve)?;
    let uncompressed = public_key.to_encoded_point(false);
    Ok(Address::from_public_key(uncompressed.as_bytes())?)
}

fn parse_slot(slot: &str) -> Result<CK_SLOT_ID, SignatureManagerError> {
    slot.parse::<u32>().map(CK_SLOT_ID::from).map_err(|_| {
        SignatureManagerError::new(
            SignatureManagerErrorKind::InvalidSlot,
            format!("'{}' is not a slot identifier", slot),
        )
    })
}

fn label_of(address: &Address) -> Vec<u8> {
    address.to_checksum_string().into_bytes()
}

fn collect_objects(session: &Session<'_>) -> Result<Vec<CK_OBJECT_HANDLE>, ModuleError> {
    let mut objects = Vec::new();
    loop {
        let batch = session
            .module()
            .find_objects(session.handle(), FIND_BATCH_SIZE)?;
        if batch.is_empty() {
            return Ok(objects);
        }
        objects.extend(batch);
    }
}

/// Every object matching `template`.
fn find_all(
    session: &Session<'_>,
    template: &[Attribute],
) -> Result<Vec<CK_OBJECT_HANDLE>, ModuleError> {
    session
        .module()
        .find_objects_init(session.handle(), template)?;
    let found = collect_objects(session);
    let finished = session.module().find_objects_final(session.handle());
    let found = found?;
    finished?;
    Ok(found)
}

/// The first object matching `template`, if any.
fn find_one(
    session: &Session<'_>,
    template: &[Attribute],
) -> Result<Option<CK_OBJECT_HANDLE>, ModuleError> {
    session
        .module()
        .find_objects_init(session.handle(), template)?;
    let found = session.module().find_objects(session.handle(), 1);
    let finished = session.module().find_objects_final(session.handle());
    let found = found?;
    finished?;
    Ok(found.into_iter().next())
}

fn key_template(class: pkcs11::types::CK_OBJECT_CLASS, address: &Address) -> [Attribute; 2] {
    [Attribute::Class(class), Attribute::Label(label_of(address))]
}

/// [`DigitalSignatureManager`] over any [`Pkcs11Module`].
pub struct Pkcs11SignatureManager {
    module: Arc<dyn Pkcs11Module>,
    return_codes: Arc<ReturnCodeTable>,
    last_timestamp: AtomicU64,
}

impl Pkcs11SignatureManager {
    /// A manager for `module`, translating its return codes with the standard table.
    pub fn new(module: Arc<dyn Pkcs11Module>) -> Self {
        Self::with_return_codes(module, Arc::new(ReturnCodeTable::standard()))
    }

    /// A manager for `module`, translating its return codes with `return_codes`.
    pub fn with_return_codes(
        module: Arc<dyn Pkcs11Module>,
        return_codes: Arc<ReturnCodeTable>,
    ) -> Self {
        Self {
            module,
            return_codes,
            last_timestamp: AtomicU64::new(0),
        }
    }

    fn translate(&self, err: ModuleError, message: impl Into<String>) -> SignatureManagerError {
        self.return_codes.translate(err, message)
    }

    fn slot_logger(&self, access: &SlotAccess, logger: &Logger) -> Logger {
        logger.new(slog::o!("slot" => access.slot().to_string(), "standard" => "PKCS#11"))
    }

    fn session<'a>(
        &'a self,
        access: &SlotAccess,
        mode: SessionMode,
        logger: &'a Logger,
    ) -> Result<Session<'a>, SignatureManagerError> {
        let slot = parse_slot(access.slot())?;
        let mut session = Session::open(self.module.as_ref(), slot, mode, logger)
            .map_err(|err| self.translate(err, "unable to open a session"))?;
        session
            .login(access.pin())
            .map_err(|err| self.translate(err, "unable to log in"))?;
        Ok(session)
    }

    /// Nanoseconds since the Unix epoch, strictly greater than any value returned before.
    fn next_timestamp(&self) -> u64 {
        let now = u64::try_from(OffsetDateTime::now_utc().unix_timestamp_nanos()).unwrap_or(0);
        let previous = match self.last_timestamp.fetch_update(
            Ordering::SeqCst,
            Ordering::SeqCst,
            |last| Some(now.max(last.saturating_add(1))),
        ) {
            Ok(previous) | Err(previous) => previous,
        };
        now.max(previous.saturating_add(1))
    }

    fn read_address(
        &self,
        session: &Session<'_>,
        object: CK_OBJECT_HANDLE,
    ) -> Result<Address, SignatureManagerError> {
        let ec_point = session
            .module()
            .get_attribute_value(session.handle(), object, CKA_EC_POINT)
            .map_err(|err| self.translate(err, "unable to read the EC point"))?;
        address_from_ec_point(&ec_point).map_err(|err| {
            SignatureManagerError::new(SignatureManagerErrorKind::Internal, err.to_string())
        })
    }

    fn destroy_pair(
        &self,
        session: &Session<'_>,
        objects: &[CK_OBJECT_HANDLE],
        logger: &Logger,
    ) -> Result<(), SignatureManagerError> {
        let mut first_error = None;
        for object in objects {
            if let Err(err) = session.module().destroy_object(session.handle(), *object) {
                slog::warn!(logger, "unable to destroy key object"; "object" => object, "error" => %err);
                first_error.get_or_insert(err);
            }
        }
        match first_error {
            Some(err) => Err(self.translate(err, "unable to destroy the key pair")),
            None => Ok(()),
        }
    }
}

impl fmt::Debug for Pkcs11SignatureManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pkcs11SignatureManager")
            .field("return_codes", &self.return_codes)
            .finish_non_exhaustive()
    }
}

impl DigitalSignatureManager for Pkcs11SignatureManager {
    fn open(&self, logger: &Logger) -> Result<(), SignatureManagerError> {
        self.module
            .initialize()
            .map_err(|err| self.translate(err, "unable to initialize the module"))?;
        slog::debug!(logger, "module initialized"; "standard" => "PKCS#11");
        Ok(())
    }

    fn close(&self, logger: &Logger) -> Result<(), SignatureManagerError> {
        self.module
            .finalize()
            .map_err(|err| self.translate(err, "unable to finalize the module"))?;
        slog::debug!(logger, "module finalized"; "standard" => "PKCS#11");
        Ok(())
    }

    fn generate_key(
        &self,
        access: &SlotAccess,
        logger: &Logger,
    ) -> Result<Address, SignatureManagerError> {
        let logger = self.slot_logger(access, logger);
        let session = self.session(access, SessionMode::ReadWrite, &logger)?;

        let public_id = self.next_timestamp().to_be_bytes().to_vec();
        let private_id = self.next_timestamp().to_be_bytes().to_vec();
        let public_key_template = [
            Attribute::KeyType(CKK_EC),
            Attribute::Class(CKO_PUBLIC_KEY),
            Attribute::Token(true),
            Attribute::Verify(true),
            Attribute::EcParams(SECP256K1_EC_PARAMS.to_vec()),
            Attribute::Private(false),
            Attribute::Label(hex::encode(&public_id).into_bytes()),
            Attribute::Id(public_id),
        ];
        let private_key_template = [
            Attribute::KeyType(CKK_EC),
            Attribute::Class(CKO_PRIVATE_KEY),
            Attribute::Token(true),
            Attribute::Sign(true),
            Attribute::Derive(false),
            Attribute::Private(true),
            Attribute::Label(hex::encode(&private_id).into_bytes()),
            Attribute::Id(private_id),
        ];

        let (public_key, private_key) = self
            .module
            .generate_key_pair(
                session.handle(),
                Mechanism::EcKeyPairGen,
                &public_key_template,
                &private_key_template,
            )
            .map_err(|err| {
                SignatureManagerError::new(
                    SignatureManagerErrorKind::KeyGenerationFailed,
                    "unable to generate the key pair",
                )
                .with_source(err)
            })?;

        let address = match self.read_address(&session, public_key) {
            Ok(address) => address,
            Err(err) => {
                slog::error!(logger, "generated public key is unusable"; "error" => %err);
                // Keep the token free of pairs nobody can address.
                if let Err(cleanup) =
                    self.destroy_pair(&session, &[public_key, private_key], &logger)
                {
                    slog::warn!(logger, "unusable key pair left on the token"; "error" => %cleanup);
                }
                return Err(SignatureManagerError::new(
                    SignatureManagerErrorKind::KeyGenerationFailed,
                    err.message(),
                ));
            }
        };

        let label = Attribute::Label(label_of(&address));
        for object in [public_key, private_key] {
            if let Err(err) = self
                .module
                .set_attribute_value(session.handle(), object, &label)
            {
                slog::warn!(logger, "unable to label key object"; "object" => object, "address" => %address, "error" => %err);
            }
        }

        slog::info!(logger, "key pair generated"; "address" => %address);
        Ok(address)
    }

    fn remove_key(
        &self,
        access: &SlotAccess,
        address: &Address,
        logger: &Logger,
    ) -> Result<(), SignatureManagerError> {
        let logger = self.slot_logger(access, logger);
        let session = self.session(access, SessionMode::ReadWrite, &logger)?;

        let private_keys = find_all(&session, &key_template(CKO_PRIVATE_KEY, address))
            .map_err(|err| self.translate(err, "unable to search for the private keys"))?;
        let public_keys = find_all(&session, &key_template(CKO_PUBLIC_KEY, address))
            .map_err(|err| self.translate(err, "unable to search for the public keys"))?;

        // Every object carrying the label goes, duplicates included.
        let objects: Vec<_> = private_keys.into_iter().chain(public_keys).collect();
        if objects.is_empty() {
            return Err(SignatureManagerError::new(
                SignatureManagerErrorKind::NotFound,
                format!("no key pair labeled {}", address),
            ));
        }
        self.destroy_pair(&session, &objects, &logger)?;

        slog::info!(logger, "key pair removed"; "address" => %address);
        Ok(())
    }

    fn list_keys(
        &self,
        access: &SlotAccess,
        logger: &Logger,
    ) -> Result<Vec<Address>, SignatureManagerError> {
        let logger = self.slot_logger(access, logger);
        let session = self.session(access, SessionMode::ReadOnly, &logger)?;

        let objects = find_all(
            &session,
            &[Attribute::Class(CKO_PUBLIC_KEY), Attribute::KeyType(CKK_EC)],
        )
        .map_err(|err| self.translate(err, "unable to search for public keys"))?;

        let mut keys = Vec::with_capacity(objects.len());
        for object in objects {
            let label = match self
                .module
                .get_attribute_value(session.handle(), object, CKA_LABEL)
            {
                Ok(label) => label,
                Err(err) => {
                    slog::warn!(logger, "skipping key without a readable label"; "object" => object, "error" => %err);
                    continue;
                }
            };
            let address = match self.read_address(&session, object) {
                Ok(address) => address,
                Err(err) => {
                    slog::warn!(logger, "skipping key without a readable EC point"; "object" => object, "error" => %err);
                    continue;
                }
            };
            if label != label_of(&address) {
                slog::debug!(logger, "skipping key whose label does not match its point"; "object" => object);
                continue;
            }
            // Imported keys carry no creation timestamp and sort first.
            let created = self
                .module
                .get_attribute_value(session.handle(), object, CKA_ID)
                .ok()
                .and_then(|id| <[u8; 8]>::try_from(id.as_slice()).ok())
                .map(u64::from_be_bytes)
                .unwrap_or(0);
            keys.push((created, address));
        }
        keys.sort_by_key(|(created, _)| *created);

        Ok(keys.into_iter().map(|(_, address)| address).collect())
    }

    fn sign(
        &self,
        access: &SlotAccess,
        address: &Address,
        digest: &[u8],
        logger: &Logger,
    ) -> Result<Vec<u8>, SignatureManagerError> {
        let logger = self.slot_logger(access, logger);
        let session = self.session(access, SessionMode::ReadWrite, &logger)?;

        let private_key = find_one(&session, &key_template(CKO_PRIVATE_KEY, address))
            .map_err(|err| self.translate(err, "unable to search for the private key"))?
            .ok_or_else(|| {
                SignatureManagerError::new(
                    SignatureManagerErrorKind::NotFound,
                    format!("no private key labeled {}", address),
                )
            })?;

        self.module
            .sign_init(session.handle(), Mechanism::Ecdsa, private_key)
            .map_err(|err| self.translate(err, "unable to start signing"))?;
        let signature = self
            .module
            .sign(session.handle(), digest)
            .map_err(|err| self.translate(err, "unable to sign"))?;

        slog::debug!(logger, "digest signed"; "address" => %address);
        Ok(signature)
    }

    fn is_alive(
        &self,
        access: &SlotAccess,
        logger: &Logger,
    ) -> Result<bool, SignatureManagerError> {
        let logger = self.slot_logger(access, logger);
        let _session = self.session(access, SessionMode::ReadWrite, &logger)?;
        Ok(true)
    }
}
