//! Error type for the descrambling pipeline.

/// Errors raised while turning a multicast datagram into cleartext TS.
///
/// Every variant is terminal for the channel engine that hit it: the
/// stream layout is outside what this relay supports, or the master key
/// is wrong, and retrying the same stream would fail the same way.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum DescrambleError {
    /// RTP version field was not 2.
    #[error("unexpected RTP version {0}")]
    RtpVersion(u8),

    /// Datagram too short for its RTP header, or the payload after the
    /// header is not a whole number of TS packets.
    #[error("unexpected RTP payload length {0}")]
    RtpPayloadLength(usize),

    /// TS packet did not start with the 0x47 sync byte.
    #[error("expected sync byte but got {0:#04x}")]
    TsSync(u8),

    /// PAT section used a non-zero pointer field.
    #[error("PAT pointer fields are not supported")]
    PatPointer,

    /// PAT carried an unexpected table id.
    #[error("unexpected PAT table id {0:#04x}")]
    PatTable(u8),

    /// PMT section used a non-zero pointer field.
    #[error("PMT pointer fields are not supported")]
    PmtPointer,

    /// PMT carried an unexpected table id.
    #[error("unexpected PMT table id {0:#04x}")]
    PmtTable(u8),

    /// The PMT program-info loop ended without a matching CA descriptor.
    #[error("cannot find ECM PID")]
    EcmPidNotFound,

    /// ECM plaintext did not start with the expected magic, which almost
    /// always means the channel's master key is wrong.
    #[error("ECM decryption produced bad magic")]
    EcmMagic,
}
