use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use bytes::BytesMut;
use hmac::{Hmac, Mac};
use md5::{Digest as Md5Digest, Md5};
use parking_lot::Mutex;
use rand::Rng;
use rsa::{Pkcs1v15Encrypt, Pkcs1v15Sign, RsaPrivateKey, RsaPublicKey};
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use x25519_dalek::{PublicKey as AgreementPublic, StaticSecret};

use std::collections::BTreeMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use aes::cipher::{AsyncStreamCipher, KeyIvInit};

use tokio::time::Instant;

use crate::cache;
use crate::config::Settings;
use crate::error::Reason;
use crate::stream::{StreamReader, StreamReaderObserver, StreamWriter};
use crate::subscriptions::Subscription;

type Aes128CfbEnc = cfb_mode::Encryptor<aes::Aes128>;
type Aes128CfbDec = cfb_mode::Decryptor<aes::Aes128>;
type HmacSha1 = Hmac<Sha1>;

/// frame header: algorithm index and ciphertext length.
const FRAME_HEADER: usize = 8;
const MAC_SIZE: usize = 20;
const BLOCK_SIZE: usize = 16;

/// plaintext consumed per frame.
const MAX_FRAME_PLAINTEXT: usize = 16 * 1024;

/// receive keys older than this many indices behind the newest are
/// forgotten.
const KEY_RETENTION: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MlsState {
    Pending,
    /// stalled until the caller supplies keys, passphrases, or
    /// signatures; interrogate the `needs_*` queries.
    WaitingForNeededInformation,
    Connected,
    Shutdown,
}

/// How keying material travels inside the signed bundle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyingType {
    Passphrase,
    PublicKey,
    KeyAgreement,
}

impl KeyingType {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Passphrase => "passphrase",
            Self::PublicKey => "public-key",
            Self::KeyAgreement => "key-agreement",
        }
    }

    fn parse(value: &str) -> Option<Self> {
        match value {
            "passphrase" => Some(Self::Passphrase),
            "public-key" => Some(Self::PublicKey),
            "key-agreement" => Some(Self::KeyAgreement),
            _ => None,
        }
    }
}

pub trait MlsObserver: Send + Sync {
    fn on_state_changed(&self, channel: &Arc<MlsChannel>, state: MlsState);
}

pub struct MlsOptions {
    pub local_context_id: String,
    /// how this side wraps its send keying material.
    pub keying: KeyingType,
}

/// The signed JSON keying bundle, the first frame on the encoded
/// stream.  Field order is the canonical wire order.
#[derive(Debug, Serialize, Deserialize)]
struct KeyingBundle {
    context_id: String,
    nonce: String,
    keying_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    wrapped_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    agreement_public_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    agreement_fingerprint: Option<String>,
    #[serde(default)]
    signature: String,
}

/// per-index material for one direction.
struct KeySet {
    key: [u8; 16],
    iv: [u8; BLOCK_SIZE],
    integrity: Vec<u8>,
}

struct DirectionKeys {
    master: [u8; 32],
    sets: BTreeMap<u32, KeySet>,
}

impl DirectionKeys {
    fn new(master: [u8; 32]) -> Self {
        Self {
            master,
            sets: BTreeMap::new(),
        }
    }

    /// derive (or fetch) the material for an algorithm index.
    fn materialize(&mut self, index: u32, legacy_iv: bool) -> &mut KeySet {
        self.sets.entry(index).or_insert_with(|| {
            let key20 = hmac_label(&self.master, &format!("key:{}", index));
            let mut key = [0u8; 16];
            key.copy_from_slice(&key20[..16]);

            let mut iv = [0u8; BLOCK_SIZE];
            if legacy_iv {
                // the legacy mode seeds the chain with an MD5 digest
                // and only switches to the HMAC chain afterwards.
                let mut hasher = Md5::new();
                hasher.update(self.master);
                hasher.update(format!("iv:{}", index));
                iv.copy_from_slice(&hasher.finalize());
            } else {
                let iv20 = hmac_label(&self.master, &format!("iv:{}", index));
                iv.copy_from_slice(&iv20[..BLOCK_SIZE]);
            }

            let integrity = hex(&hmac_label(&self.master, &format!("integrity:{}", index)));

            KeySet {
                key,
                iv,
                integrity: integrity.into_bytes(),
            }
        })
    }

    fn prune_before(&mut self, index: u32) {
        let keep = index.saturating_sub(KEY_RETENTION);
        self.sets.retain(|i, _| *i >= keep);
    }
}

struct Inner {
    state: MlsState,
    reason: Option<Reason>,

    // local material.
    signing_key: Option<RsaPrivateKey>,
    decryption_key: Option<RsaPrivateKey>,
    remote_verify_key: Option<RsaPublicKey>,
    remote_encryption_key: Option<RsaPublicKey>,
    passphrase: Option<String>,
    agreement_secret: Option<StaticSecret>,

    remote_context_id: Option<String>,
    remote_keying_type: Option<KeyingType>,
    pending_remote_bundle: Option<KeyingBundle>,

    send: Option<DirectionKeys>,
    receive: Option<DirectionKeys>,
    send_index: u32,
    receive_newest: u32,
    last_rotation: Instant,
    bundle_sent: bool,

    receive_buffer: BytesMut,
    discarded_frames: u64,

    _subs: Vec<Subscription>,
}

/// Message-layer security over a pair of transport streams.
///
/// Application plaintext moves through the "decoded" streams; the
/// "encoded" streams carry the signed keying bundle followed by
/// AES-CFB frames authenticated with HMAC-SHA1 and rotated keying
/// indices.
pub struct MlsChannel {
    local_context_id: String,
    keying: KeyingType,
    rotation_interval: Duration,
    legacy_iv: bool,
    observer: Arc<dyn MlsObserver>,

    receive_encoded: StreamReader,
    receive_decoded: StreamWriter,
    send_decoded: StreamReader,
    send_encoded: StreamWriter,

    inner: Mutex<Inner>,
}

struct SendBridge(Weak<MlsChannel>);

impl StreamReaderObserver for SendBridge {
    fn on_reader_ready(&self) {
        if let Some(channel) = self.0.upgrade() {
            channel.pump_send();
        }
    }
}

struct ReceiveBridge(Weak<MlsChannel>);

impl StreamReaderObserver for ReceiveBridge {
    fn on_reader_ready(&self) {
        if let Some(channel) = self.0.upgrade() {
            channel.pump_receive();
        }
    }
}

impl MlsChannel {
    pub fn create(
        settings: &Settings,
        options: MlsOptions,
        receive_encoded: StreamReader,
        receive_decoded: StreamWriter,
        send_decoded: StreamReader,
        send_encoded: StreamWriter,
        observer: Arc<dyn MlsObserver>,
    ) -> Arc<Self> {
        let channel = Arc::new(Self {
            local_context_id: options.local_context_id,
            keying: options.keying,
            rotation_interval: settings.mls_rotation_interval(),
            legacy_iv: settings.mls_legacy_passphrase_iv,
            observer,
            receive_encoded,
            receive_decoded,
            send_decoded,
            send_encoded,
            inner: Mutex::new(Inner {
                state: MlsState::Pending,
                reason: None,
                signing_key: None,
                decryption_key: None,
                remote_verify_key: None,
                remote_encryption_key: None,
                passphrase: None,
                agreement_secret: None,
                remote_context_id: None,
                remote_keying_type: None,
                pending_remote_bundle: None,
                send: None,
                receive: None,
                send_index: 1,
                receive_newest: 0,
                last_rotation: Instant::now(),
                bundle_sent: false,
                receive_buffer: BytesMut::new(),
                discarded_frames: 0,
                _subs: Vec::new(),
            }),
        });

        let send_sub = channel
            .send_decoded
            .subscribe(Arc::new(SendBridge(Arc::downgrade(&channel))));
        let recv_sub = channel
            .receive_encoded
            .subscribe(Arc::new(ReceiveBridge(Arc::downgrade(&channel))));

        channel.inner.lock()._subs = vec![send_sub, recv_sub];
        channel.send_decoded.notify_ready_to_read();
        channel.receive_encoded.notify_ready_to_read();

        channel.drive();
        channel.progress();
        channel
    }

    pub fn state(&self) -> (MlsState, Option<Reason>) {
        let inner = self.inner.lock();
        (inner.state, inner.reason)
    }

    pub fn remote_context_id(&self) -> Option<String> {
        self.inner.lock().remote_context_id.clone()
    }

    /// frames dropped for bad MACs or unknown keying indices.
    pub fn discarded_frames(&self) -> u64 {
        self.inner.lock().discarded_frames
    }

    // ---- "needs" interrogation ----

    /// an RSA key to sign the outgoing keying bundle with.
    pub fn needs_local_signing_key(&self) -> bool {
        let inner = self.inner.lock();
        inner.signing_key.is_none() && !inner.bundle_sent
    }

    /// the remote public key that validates the peer's bundle.
    pub fn needs_remote_verify_key(&self) -> bool {
        let inner = self.inner.lock();
        inner.pending_remote_bundle.is_some() && inner.remote_verify_key.is_none()
    }

    /// material to decode the peer's keying, and which kind.
    pub fn needs_receive_keying(&self) -> Option<KeyingType> {
        let inner = self.inner.lock();
        if inner.receive.is_some() {
            return None;
        }

        let keying = inner.remote_keying_type?;
        let missing = match keying {
            KeyingType::Passphrase => inner.passphrase.is_none(),
            KeyingType::PublicKey => inner.decryption_key.is_none(),
            KeyingType::KeyAgreement => false,
        };

        missing.then_some(keying)
    }

    /// material to encode our keying, and which kind.
    pub fn needs_send_keying(&self) -> Option<KeyingType> {
        let inner = self.inner.lock();
        if inner.send.is_some() {
            return None;
        }

        let missing = match self.keying {
            KeyingType::Passphrase => inner.passphrase.is_none(),
            KeyingType::PublicKey => inner.remote_encryption_key.is_none(),
            KeyingType::KeyAgreement => false,
        };

        missing.then_some(self.keying)
    }

    // ---- supplying material ----

    pub fn set_local_signing_key(self: &Arc<Self>, key: RsaPrivateKey) {
        self.inner.lock().signing_key = Some(key);
        self.progress();
    }

    pub fn set_local_decryption_key(self: &Arc<Self>, key: RsaPrivateKey) {
        self.inner.lock().decryption_key = Some(key);
        self.progress();
    }

    pub fn set_remote_verify_key(self: &Arc<Self>, key: RsaPublicKey) {
        self.inner.lock().remote_verify_key = Some(key);
        self.progress();
    }

    pub fn set_remote_encryption_key(self: &Arc<Self>, key: RsaPublicKey) {
        self.inner.lock().remote_encryption_key = Some(key);
        self.progress();
    }

    pub fn set_passphrase(self: &Arc<Self>, passphrase: &str) {
        self.inner.lock().passphrase = Some(passphrase.to_string());
        self.progress();
    }

    pub fn cancel(self: &Arc<Self>) {
        {
            let mut inner = self.inner.lock();
            if inner.state == MlsState::Shutdown {
                return;
            }

            inner.state = MlsState::Shutdown;
            inner.receive_buffer.clear();
            inner._subs.clear();
        }

        self.receive_decoded.cancel();
        self.send_encoded.cancel();
        self.observer.on_state_changed(self, MlsState::Shutdown);
    }

    fn drive(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(Duration::from_secs(1)).await;
                let Some(channel) = weak.upgrade() else { return };

                let rotate = {
                    let mut inner = channel.inner.lock();
                    if inner.state == MlsState::Shutdown {
                        return;
                    }

                    if inner.state == MlsState::Connected
                        && Instant::now().duration_since(inner.last_rotation)
                            >= channel.rotation_interval
                    {
                        inner.send_index += 1;
                        inner.last_rotation = Instant::now();
                        true
                    } else {
                        false
                    }
                };

                if rotate {
                    log::debug!(
                        "mls sender rotated keys: index={}",
                        channel.inner.lock().send_index
                    );
                }
            }
        });
    }

    /// advance whatever the newly supplied material unlocked.
    fn progress(self: &Arc<Self>) {
        self.try_establish_send();
        self.try_unwrap_remote_bundle();
        self.pump_send();
        self.pump_receive();
        self.update_state();
    }

    /// generate and emit our keying bundle once the material allows.
    fn try_establish_send(self: &Arc<Self>) {
        let bundle = {
            let mut inner = self.inner.lock();
            if inner.bundle_sent || inner.state == MlsState::Shutdown {
                return;
            }

            let Some(signing_key) = inner.signing_key.clone() else {
                return;
            };

            let mut master = [0u8; 32];
            rand::thread_rng().fill(&mut master);

            let nonce: [u8; 16] = rand::thread_rng().r#gen();
            let mut bundle = KeyingBundle {
                context_id: self.local_context_id.clone(),
                nonce: BASE64.encode(nonce),
                keying_type: self.keying.as_str().to_string(),
                wrapped_key: None,
                agreement_public_key: None,
                agreement_fingerprint: None,
                signature: String::new(),
            };

            match self.keying {
                KeyingType::Passphrase => {
                    let Some(passphrase) = inner.passphrase.clone() else {
                        return;
                    };

                    let mut wrapped = master.to_vec();
                    let (key, iv) = passphrase_wrapping_material(&passphrase, &nonce);
                    let Ok(enc) = Aes128CfbEnc::new_from_slices(&key, &iv) else {
                        return;
                    };

                    enc.encrypt(&mut wrapped);
                    bundle.wrapped_key = Some(BASE64.encode(wrapped));
                }
                KeyingType::PublicKey => {
                    let Some(remote) = inner.remote_encryption_key.clone() else {
                        return;
                    };

                    let Ok(wrapped) =
                        remote.encrypt(&mut rand::thread_rng(), Pkcs1v15Encrypt, &master)
                    else {
                        return;
                    };

                    bundle.wrapped_key = Some(BASE64.encode(wrapped));
                }
                KeyingType::KeyAgreement => {
                    // the master is derived once the peer's public
                    // key arrives; only our half travels now.
                    let secret = StaticSecret::random_from_rng(rand::thread_rng());
                    let public = AgreementPublic::from(&secret);
                    bundle.agreement_public_key = Some(BASE64.encode(public.as_bytes()));
                    bundle.agreement_fingerprint =
                        Some(hex(&Sha1::digest(public.as_bytes())));
                    inner.agreement_secret = Some(secret);
                }
            }

            // sign the bundle with the signature field empty.
            let unsigned = serde_json::to_vec(&bundle).expect("bundle encodes");
            let digest = Sha1::digest(&unsigned);
            let Ok(signature) = signing_key.sign(Pkcs1v15Sign::new::<Sha1>(), &digest) else {
                return;
            };

            bundle.signature = BASE64.encode(signature);

            if self.keying != KeyingType::KeyAgreement {
                inner.send = Some(DirectionKeys::new(master));
            }

            inner.bundle_sent = true;
            inner.last_rotation = Instant::now();
            bundle
        };

        let frame = serde_json::to_vec(&bundle).expect("bundle encodes");
        let mut out = BytesMut::with_capacity(frame.len() + FRAME_HEADER);
        out.extend_from_slice(&0u32.to_be_bytes());
        out.extend_from_slice(&(frame.len() as u32).to_be_bytes());
        out.extend_from_slice(&frame);
        self.send_encoded.write(&out);

        log::debug!("mls keying bundle sent: type={:?}", self.keying);
    }

    /// unwrap the peer's keying bundle once material allows.
    fn try_unwrap_remote_bundle(self: &Arc<Self>) {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let Some(bundle) = inner.pending_remote_bundle.take() else {
            return;
        };

        // signature first; an unverifiable bundle stays pending until
        // the verify key shows up.
        let Some(verify_key) = inner.remote_verify_key.clone() else {
            inner.pending_remote_bundle = Some(bundle);
            return;
        };

        let unsigned = KeyingBundle {
            context_id: bundle.context_id.clone(),
            nonce: bundle.nonce.clone(),
            keying_type: bundle.keying_type.clone(),
            wrapped_key: bundle.wrapped_key.clone(),
            agreement_public_key: bundle.agreement_public_key.clone(),
            agreement_fingerprint: bundle.agreement_fingerprint.clone(),
            signature: String::new(),
        };

        let payload = serde_json::to_vec(&unsigned).expect("bundle encodes");
        let digest = Sha1::digest(&payload);
        let Ok(signature) = BASE64.decode(&bundle.signature) else {
            inner.discarded_frames += 1;
            return;
        };

        if verify_key
            .verify(Pkcs1v15Sign::new::<Sha1>(), &digest, &signature)
            .is_err()
        {
            log::warn!("mls keying bundle signature rejected");
            inner.discarded_frames += 1;
            return;
        }

        let Some(keying) = KeyingType::parse(&bundle.keying_type) else {
            inner.discarded_frames += 1;
            return;
        };

        let master: Option<[u8; 32]> = match keying {
            KeyingType::Passphrase => {
                let Some(passphrase) = inner.passphrase.clone() else {
                    inner.pending_remote_bundle = Some(bundle);
                    return;
                };

                bundle
                    .wrapped_key
                    .as_ref()
                    .and_then(|w| BASE64.decode(w).ok())
                    .and_then(|mut wrapped| {
                        let nonce = BASE64.decode(&bundle.nonce).ok()?;
                        let (key, iv) = passphrase_wrapping_material(&passphrase, &nonce);
                        let dec = Aes128CfbDec::new_from_slices(&key, &iv).ok()?;
                        dec.decrypt(&mut wrapped);
                        wrapped.try_into().ok()
                    })
            }
            KeyingType::PublicKey => {
                let Some(private) = inner.decryption_key.clone() else {
                    inner.pending_remote_bundle = Some(bundle);
                    return;
                };

                bundle
                    .wrapped_key
                    .as_ref()
                    .and_then(|w| BASE64.decode(w).ok())
                    .and_then(|wrapped| private.decrypt(Pkcs1v15Encrypt, &wrapped).ok())
                    .and_then(|master| master.try_into().ok())
            }
            KeyingType::KeyAgreement => {
                let Some(secret) = inner.agreement_secret.as_ref() else {
                    // our own bundle has not generated a secret yet.
                    inner.pending_remote_bundle = Some(bundle);
                    return;
                };

                let public = bundle
                    .agreement_public_key
                    .as_ref()
                    .and_then(|p| BASE64.decode(p).ok())
                    .and_then(|p| <[u8; 32]>::try_from(p).ok());

                let Some(public) = public else {
                    inner.discarded_frames += 1;
                    return;
                };

                // fingerprint pinning when present.
                if let Some(expected) = &bundle.agreement_fingerprint
                    && &hex(&Sha1::digest(public)) != expected
                {
                    inner.discarded_frames += 1;
                    return;
                }

                let shared = secret.diffie_hellman(&AgreementPublic::from(public));
                let remote_context = bundle.context_id.clone();
                let label = format!("{}:{}", remote_context, self.local_context_id);
                let derived = hmac_label_bytes(shared.as_bytes(), label.as_bytes());

                let mut master = [0u8; 32];
                master[..20].copy_from_slice(&derived);
                master[20..].copy_from_slice(&derived[..12]);

                // both directions share the agreed master; the label
                // above is ordered remote-first so the peer derives
                // the mirrored send label.
                let send_label = format!("{}:{}", self.local_context_id, remote_context);
                let send_derived = hmac_label_bytes(shared.as_bytes(), send_label.as_bytes());
                let mut send_master = [0u8; 32];
                send_master[..20].copy_from_slice(&send_derived);
                send_master[20..].copy_from_slice(&send_derived[..12]);
                inner.send = Some(DirectionKeys::new(send_master));

                Some(master)
            }
        };

        let Some(master) = master else {
            log::warn!("mls keying bundle could not be unwrapped");
            inner.discarded_frames += 1;
            return;
        };

        inner.remote_context_id = Some(bundle.context_id.clone());
        inner.remote_keying_type = Some(keying);
        inner.receive = Some(DirectionKeys::new(master));

        log::debug!(
            "mls receive keying established: type={:?}, context={:?}",
            keying,
            bundle.context_id
        );
    }

    /// encrypt pending plaintext into frames.
    fn pump_send(self: &Arc<Self>) {
        loop {
            let frame = {
                let mut inner = self.inner.lock();
                if inner.state == MlsState::Shutdown || inner.send.is_none() {
                    return;
                }

                let mut plaintext = vec![0u8; MAX_FRAME_PLAINTEXT];
                let n = self.send_decoded.read(&mut plaintext);
                if n == 0 {
                    return;
                }

                plaintext.truncate(n);

                let index = inner.send_index;
                let legacy = self.legacy_iv && self.keying == KeyingType::Passphrase;
                let send = inner.send.as_mut().expect("send keys");
                let set = send.materialize(index, legacy);

                let Ok(enc) = Aes128CfbEnc::new_from_slices(&set.key, &set.iv) else {
                    return;
                };

                enc.encrypt(&mut plaintext);
                let mac = frame_mac(&set.integrity, index, &plaintext);

                // the iv chains forward per frame.
                set.iv = next_iv(&set.integrity, &set.iv);

                let mut frame =
                    BytesMut::with_capacity(FRAME_HEADER + plaintext.len() + MAC_SIZE);
                frame.extend_from_slice(&index.to_be_bytes());
                frame.extend_from_slice(&(plaintext.len() as u32).to_be_bytes());
                frame.extend_from_slice(&plaintext);
                frame.extend_from_slice(&mac);
                frame
            };

            self.send_encoded.write(&frame);
        }
    }

    /// parse, verify, and decrypt inbound frames.
    fn pump_receive(self: &Arc<Self>) {
        loop {
            enum Step {
                Plaintext(Vec<u8>),
                Bundle,
                Again,
            }

            let step = {
                let mut guard = self.inner.lock();
                let inner = &mut *guard;
                if inner.state == MlsState::Shutdown {
                    return;
                }

                // pull everything available off the encoded stream.
                let available = self.receive_encoded.total_size_available();
                if available > 0 {
                    let start = inner.receive_buffer.len();
                    inner.receive_buffer.resize(start + available, 0);
                    let n = {
                        let slice = &mut inner.receive_buffer[start..];
                        self.receive_encoded.read(slice)
                    };
                    inner.receive_buffer.truncate(start + n);
                }

                if inner.receive_buffer.len() < FRAME_HEADER {
                    return;
                }

                let index = u32::from_be_bytes(
                    inner.receive_buffer[..4].try_into().expect("frame header"),
                );
                let size = u32::from_be_bytes(
                    inner.receive_buffer[4..8].try_into().expect("frame header"),
                ) as usize;

                if index == 0 {
                    // keying bundle: no mac, json payload.
                    if inner.receive_buffer.len() < FRAME_HEADER + size {
                        return;
                    }

                    let _ = inner.receive_buffer.split_to(FRAME_HEADER);
                    let payload = inner.receive_buffer.split_to(size);
                    match serde_json::from_slice::<KeyingBundle>(&payload) {
                        Ok(bundle) => {
                            inner.pending_remote_bundle = Some(bundle);
                            Step::Bundle
                        }
                        Err(_) => {
                            inner.discarded_frames += 1;
                            Step::Again
                        }
                    }
                } else {
                    if inner.receive_buffer.len() < FRAME_HEADER + size + MAC_SIZE {
                        return;
                    }

                    let _ = inner.receive_buffer.split_to(FRAME_HEADER);
                    let mut ciphertext = inner.receive_buffer.split_to(size).to_vec();
                    let mac = inner.receive_buffer.split_to(MAC_SIZE);

                    let legacy = self.legacy_iv
                        && inner.remote_keying_type == Some(KeyingType::Passphrase);

                    let Some(receive) = inner.receive.as_mut() else {
                        inner.discarded_frames += 1;
                        continue;
                    };

                    let set = receive.materialize(index, legacy);
                    let expected = frame_mac(&set.integrity, index, &ciphertext);
                    if expected[..] != mac[..] {
                        log::warn!("mls frame mac mismatch: index={}", index);
                        inner.discarded_frames += 1;
                        continue;
                    }

                    let Ok(dec) = Aes128CfbDec::new_from_slices(&set.key, &set.iv) else {
                        inner.discarded_frames += 1;
                        continue;
                    };

                    dec.decrypt(&mut ciphertext);
                    set.iv = next_iv(&set.integrity, &set.iv);

                    if index > inner.receive_newest {
                        inner.receive_newest = index;
                        let newest = inner.receive_newest;
                        if let Some(receive) = inner.receive.as_mut() {
                            receive.prune_before(newest);
                        }
                    }

                    Step::Plaintext(ciphertext)
                }
            };

            match step {
                Step::Plaintext(plaintext) => self.receive_decoded.write(&plaintext),
                Step::Bundle => {
                    self.try_unwrap_remote_bundle();
                    self.update_state();
                }
                Step::Again => {}
            }
        }
    }

    fn update_state(self: &Arc<Self>) {
        let next = {
            let inner = self.inner.lock();
            match inner.state {
                MlsState::Shutdown => return,
                _ => {
                    if inner.send.is_some() && inner.receive.is_some() {
                        MlsState::Connected
                    } else if self.needs_anything_locked(&inner) {
                        MlsState::WaitingForNeededInformation
                    } else {
                        MlsState::Pending
                    }
                }
            }
        };

        let changed = {
            let mut inner = self.inner.lock();
            if inner.state == next {
                false
            } else {
                inner.state = next;
                true
            }
        };

        if changed {
            log::debug!("mls state changed: state={:?}", next);
            self.observer.on_state_changed(self, next);

            if next == MlsState::Connected {
                // whatever queued up while keys were missing.
                self.pump_send();
                self.pump_receive();
            }
        }
    }

    fn needs_anything_locked(&self, inner: &Inner) -> bool {
        if inner.signing_key.is_none() && !inner.bundle_sent {
            return true;
        }

        if inner.pending_remote_bundle.is_some() {
            return true;
        }

        if inner.send.is_none() {
            let missing = match self.keying {
                KeyingType::Passphrase => inner.passphrase.is_none(),
                KeyingType::PublicKey => inner.remote_encryption_key.is_none(),
                KeyingType::KeyAgreement => false,
            };

            if missing {
                return true;
            }
        }

        false
    }
}

/// load an RSA private key from PKCS#1 DER, skipping the expensive
/// validation when the key's fingerprint already passed it once.
pub fn load_validated_private_key(der: &[u8]) -> anyhow::Result<RsaPrivateKey> {
    use rsa::pkcs1::DecodeRsaPrivateKey;

    let fingerprint = hex(&Sha1::digest(der));
    let cache_key = format!("mls/rsa-validated/{}", fingerprint);
    let store = cache::singleton();

    let key = RsaPrivateKey::from_pkcs1_der(der)?;
    if store.fetch(&cache_key).is_none() {
        key.validate()?;
        store.store(&cache_key, "1", Some(Duration::from_secs(30 * 24 * 3600)));
    }

    Ok(key)
}

fn hmac_label(master: &[u8], label: &str) -> [u8; 20] {
    hmac_label_bytes(master, label.as_bytes())
}

fn hmac_label_bytes(key: &[u8], message: &[u8]) -> [u8; 20] {
    let mut mac = HmacSha1::new_from_slice(key).expect("hmac accepts any key size");
    mac.update(message);
    let mut out = [0u8; 20];
    out.copy_from_slice(&mac.finalize().into_bytes());
    out
}

/// the per-frame MAC covers the index and the ciphertext.
fn frame_mac(integrity: &[u8], index: u32, ciphertext: &[u8]) -> [u8; 20] {
    let mut mac = HmacSha1::new_from_slice(integrity).expect("hmac accepts any key size");
    mac.update(&index.to_be_bytes());
    mac.update(ciphertext);
    let mut out = [0u8; 20];
    out.copy_from_slice(&mac.finalize().into_bytes());
    out
}

fn next_iv(integrity: &[u8], previous: &[u8; BLOCK_SIZE]) -> [u8; BLOCK_SIZE] {
    let digest = hmac_label_bytes(integrity, previous);
    let mut iv = [0u8; BLOCK_SIZE];
    iv.copy_from_slice(&digest[..BLOCK_SIZE]);
    iv
}

/// derive the AES key and IV that wrap a passphrase-protected master.
fn passphrase_wrapping_material(passphrase: &str, nonce: &[u8]) -> ([u8; 16], [u8; 16]) {
    let keying = hmac_label_bytes(passphrase.as_bytes(), nonce);
    let mut key = [0u8; 16];
    key.copy_from_slice(&keying[..16]);

    let mut hasher = Md5::new();
    hasher.update(nonce);
    hasher.update(passphrase.as_bytes());
    let iv: [u8; 16] = hasher.finalize().into();

    (key, iv)
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}
