//! ECM decryption and working-key management.
//!
//! The entitlement control messages arrive in-band on the PID announced by
//! the PMT's CA descriptor. Each ECM carries 64 bytes of AES-ECB
//! ciphertext at a fixed offset inside the TS packet; decrypting it with
//! the channel's master key yields the current pair of 16-byte working
//! keys. A selector byte in the TS header decides which half of the
//! plaintext is the even key and which the odd one.

use aes::cipher::{BlockDecrypt, KeyInit};
use aes::{Aes128, Block};

use super::error::DescrambleError;

/// Plaintext magic every well-decrypted ECM starts with.
pub const ECM_MAGIC: [u8; 3] = *b"CEB";

/// Offset of the ECM ciphertext within the TS packet.
const ECM_PAYLOAD_OFFSET: usize = 29;

/// Length of the ECM ciphertext (four AES blocks).
const ECM_PAYLOAD_LEN: usize = 64;

/// TS byte whose value selects the key orientation.
const KEY_SELECTOR_OFFSET: usize = 5;

/// Selector value that maps the first plaintext key to the even slot.
const SELECTOR_EVEN_FIRST: u8 = 0x81;

/// One installed working key, kept as its expanded AES schedule: the
/// schedule is built once per ECM rather than once per scrambled packet.
pub struct WorkingKey {
    cipher: Aes128,
}

impl WorkingKey {
    fn new(bytes: [u8; 16]) -> Self {
        Self {
            cipher: Aes128::new(&bytes.into()),
        }
    }

    /// Decrypt one 16-byte block in place.
    pub fn decrypt_block(&self, block: &mut [u8]) {
        self.cipher.decrypt_block(Block::from_mut_slice(block));
    }
}

/// The even/odd working-key pair for one channel.
///
/// Both slots start empty; every ECM reinstalls both, dropping the
/// previous pair.
#[derive(Default)]
pub struct WorkingKeys {
    even: Option<WorkingKey>,
    odd: Option<WorkingKey>,
}

impl WorkingKeys {
    pub fn new() -> Self {
        Self::default()
    }

    /// Key used for scrambling-control value 2.
    pub fn even(&self) -> Option<&WorkingKey> {
        self.even.as_ref()
    }

    /// Key used for scrambling-control value 3.
    pub fn odd(&self) -> Option<&WorkingKey> {
        self.odd.as_ref()
    }

    /// Decrypt the ECM in `pkt` with the master key and install the key
    /// pair it carries.
    ///
    /// `pkt` must be a full 188-byte TS packet on the ECM PID.
    pub fn install_from_ecm(
        &mut self,
        master: &Aes128,
        pkt: &[u8],
    ) -> Result<(), DescrambleError> {
        let mut plain = [0u8; ECM_PAYLOAD_LEN];
        plain.copy_from_slice(&pkt[ECM_PAYLOAD_OFFSET..ECM_PAYLOAD_OFFSET + ECM_PAYLOAD_LEN]);
        for block in plain.chunks_exact_mut(16) {
            master.decrypt_block(Block::from_mut_slice(block));
        }

        if plain[..3] != ECM_MAGIC {
            return Err(DescrambleError::EcmMagic);
        }

        let mut first = [0u8; 16];
        let mut second = [0u8; 16];
        first.copy_from_slice(&plain[9..25]);
        second.copy_from_slice(&plain[25..41]);

        if pkt[KEY_SELECTOR_OFFSET] == SELECTOR_EVEN_FIRST {
            self.even = Some(WorkingKey::new(first));
            self.odd = Some(WorkingKey::new(second));
        } else {
            self.odd = Some(WorkingKey::new(first));
            self.even = Some(WorkingKey::new(second));
        }
        Ok(())
    }
}

/// Build the AES schedule for a channel master key.
pub fn master_cipher(key: &[u8; 16]) -> Aes128 {
    Aes128::new(key.into())
}
