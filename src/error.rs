use thiserror::Error;

/// The generic Error type, which provides coverage for all errors this library can potentially
/// return.
///
/// Most variants are *per-session* failures: they abort the analysis of a single timer
/// candidate and must never propagate past it. The detector loop catches them, logs, and
/// moves on to the next candidate. Only [`Error::EngineInit`] is treated as fatal to a run.
///
/// # Error Categories
///
/// ## Target image access
/// - [`Error::Unreadable`] - A requested byte range is not resident in the captured image
/// - [`Error::MalformedModule`] - A module's in-memory headers could not be reconstructed
/// - [`Error::Goblin`] - PE header parsing errors from the goblin crate
///
/// ## Emulation
/// - [`Error::InvalidInstruction`] - The byte stream does not decode to an instruction
/// - [`Error::UnsupportedInstruction`] - Decoded, but outside the modeled subset
/// - [`Error::StepBudget`] - The per-session instruction budget was exhausted
/// - [`Error::EngineInit`] - The emulation session could not even be constructed
///
/// ## I/O
/// - [`Error::FileError`] - Filesystem I/O errors while opening a memory image
#[derive(Error, Debug)]
pub enum Error {
    /// A read hit memory that is not resident in the captured image.
    ///
    /// Pages can be absent because they were paged out at capture time or because the
    /// address was never part of any region. Recoverable: aborts only the current
    /// candidate's session.
    #[error("unreadable memory: {size:#x} bytes at {address:#x}")]
    Unreadable {
        /// Start of the failed read.
        address: u64,
        /// Number of bytes requested.
        size: usize,
    },

    /// The bytes at the instruction pointer do not decode to a valid instruction.
    #[error("invalid instruction at {address:#x}")]
    InvalidInstruction {
        /// Address of the undecodable bytes.
        address: u64,
    },

    /// The instruction decoded but is outside the modeled subset.
    ///
    /// Expected for certain compatibility-mode code paths (e.g. segment-prefixed
    /// addressing used by 32-bit-on-64-bit thunks). Recoverable per session.
    #[error("unsupported instruction '{mnemonic}' at {address:#x}")]
    UnsupportedInstruction {
        /// Address of the instruction.
        address: u64,
        /// Mnemonic as reported by the decoder.
        mnemonic: String,
    },

    /// The per-session instruction budget ran out before a terminal condition.
    ///
    /// Treated as a non-detection, not as an error to the caller.
    #[error("step budget of {budget} instructions exhausted")]
    StepBudget {
        /// The configured budget that was reached.
        budget: usize,
    },

    /// A module's in-memory PE headers could not be reconstructed or made no sense.
    #[error("malformed module '{module}': {message}")]
    MalformedModule {
        /// Name of the module whose headers failed to parse.
        module: String,
        /// What was wrong with them.
        message: String,
    },

    /// The emulation session could not be constructed.
    ///
    /// The only condition in this crate that is considered fatal to a run.
    #[error("failed to initialize emulation session: {0}")]
    EngineInit(String),

    /// Error from the goblin crate during PE header parsing.
    #[error("{0}")]
    Goblin(#[from] goblin::error::Error),

    /// File I/O error while opening or mapping a memory image.
    #[error("{0}")]
    FileError(#[from] std::io::Error),
}

impl Error {
    /// Convenience constructor for [`Error::Unreadable`].
    #[must_use]
    pub fn unreadable(address: u64, size: usize) -> Self {
        Error::Unreadable { address, size }
    }

    /// Returns `true` if this error only invalidates the current candidate's session.
    ///
    /// Everything except [`Error::EngineInit`] is contained within one candidate.
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, Error::EngineInit(_))
    }
}
