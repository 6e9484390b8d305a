// Standard library imports
use std::time::Duration;

// Third party imports
use ethers::core::types::U256;
use thiserror::Error;

/// Failure while talking to a single RPC endpoint
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RpcError {
    /// Endpoint unreachable or the connection broke
    #[error("Connection error: {0}")]
    Connection(String),
    /// Request did not finish in time
    #[error("Request timed out after {0:?}")]
    Timeout(Duration),
    /// Node answered with a JSON-RPC error object
    #[error("RPC error {code}: {message}")]
    Rejected { code: i64, message: String },
    /// Response could not be decoded
    #[error("Decode error: {0}")]
    Decode(String),
}

impl RpcError {
    /// True when the endpoint itself is the problem, not the request
    pub fn is_connectivity(&self) -> bool {
        matches!(self, RpcError::Connection(_) | RpcError::Timeout(_))
    }

    /// Classifies a JSON-RPC rejection, `None` for transport failures
    pub fn rejection(&self) -> Option<RejectionKind> {
        match self {
            RpcError::Rejected { message, .. } => Some(classify_rejection(message)),
            _ => None,
        }
    }
}

/// Reason a node refused a transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RejectionKind {
    /// Fee cap below the current base fee or the node's minimum
    FeeTooLow,
    /// Another transaction with the same nonce is pooled with a higher fee
    ReplacementUnderpriced,
    /// Nonce already used on chain
    NonceTooLow,
    /// Identical transaction already in the node's pool
    AlreadyKnown,
    /// Sender cannot cover value plus gas
    InsufficientFunds,
    /// Gas limit invalid for this transaction or block
    GasLimit,
    /// Anything else
    Other,
}

/// How the dispatcher reacts to a rejection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryAction {
    /// The node has the transaction already
    TreatAsSubmitted,
    /// Refresh fee suggestion, re-sign and submit once more
    RefreshFeesAndRetry,
    /// Local nonce view is stale, resync the account
    ResyncNonce,
    /// Surface the error to the caller
    Abort,
}

impl RejectionKind {
    pub fn recovery(self) -> RecoveryAction {
        match self {
            RejectionKind::AlreadyKnown => RecoveryAction::TreatAsSubmitted,
            RejectionKind::FeeTooLow | RejectionKind::ReplacementUnderpriced => {
                RecoveryAction::RefreshFeesAndRetry
            }
            RejectionKind::NonceTooLow => RecoveryAction::ResyncNonce,
            RejectionKind::InsufficientFunds | RejectionKind::GasLimit | RejectionKind::Other => {
                RecoveryAction::Abort
            }
        }
    }
}

/// Classifies a node's rejection message by keyword
pub fn classify_rejection(error_msg: &str) -> RejectionKind {
    let lower = error_msg.to_lowercase();

    if lower.contains("already known")
        || lower.contains("known transaction")
        || lower.contains("already imported")
    {
        RejectionKind::AlreadyKnown
    } else if lower.contains("replacement transaction underpriced")
        || lower.contains("replacement fee too low")
    {
        RejectionKind::ReplacementUnderpriced
    } else if lower.contains("nonce too low") || lower.contains("nonce is too low") {
        RejectionKind::NonceTooLow
    } else if lower.contains("fee too low")
        || lower.contains("underpriced")
        || lower.contains("less than block base fee")
        || lower.contains("fee cap less than")
    {
        RejectionKind::FeeTooLow
    } else if lower.contains("insufficient funds") {
        RejectionKind::InsufficientFunds
    } else if lower.contains("intrinsic gas too low") || lower.contains("exceeds block gas limit") {
        RejectionKind::GasLimit
    } else {
        RejectionKind::Other
    }
}

/// Errors surfaced by the dispatch substrate
#[derive(Debug, Clone, Error)]
pub enum FloodError {
    /// Transport or JSON-RPC failure
    #[error(transparent)]
    Rpc(#[from] RpcError),
    /// Node refused the transaction
    #[error("Transaction rejected ({kind:?}): {message}")]
    Rejected { kind: RejectionKind, message: String },
    /// Selection found no candidate endpoint
    #[error("No endpoint available for group '{0}'")]
    NoEndpoint(String),
    /// Pool preparation could not reach any endpoint
    #[error("None of the {0} configured endpoints is reachable")]
    NoReachableEndpoint(usize),
    /// Private key could not be parsed
    #[error("Invalid private key: {0}")]
    InvalidKey(String),
    /// Root account cannot cover the requested funding
    #[error("Insufficient root funds: required {required}, available {available}")]
    InsufficientRootFunds { required: U256, available: U256 },
    /// Rebroadcast budget exhausted
    #[error("Transaction with nonce {nonce} not confirmed after {attempts} rebroadcasts")]
    ConfirmationTimeout { nonce: u64, attempts: u32 },
    /// Nonce was included on chain by a transaction we did not track
    #[error("Nonce {0} was consumed by another transaction")]
    NonceConsumed(u64),
    /// Transaction is missing required fields
    #[error("Invalid transaction: {0}")]
    InvalidTransaction(String),
    /// Signer failed
    #[error("Signing failed: {0}")]
    Signing(String),
    /// Configuration invalid
    #[error("Config error: {0}")]
    Config(String),
    /// Account pool used before `prepare`
    #[error("Account pool not prepared")]
    NotPrepared,
    /// Operation aborted by cancellation
    #[error("Operation cancelled")]
    Cancelled,
}

impl FloodError {
    /// Builds a `Rejected` error from a node message
    pub fn rejected(message: impl Into<String>) -> Self {
        let message = message.into();
        FloodError::Rejected {
            kind: classify_rejection(&message),
            message,
        }
    }

    /// True when a caller should back off because no endpoint can serve it
    pub fn is_no_endpoint(&self) -> bool {
        match self {
            FloodError::NoEndpoint(_) | FloodError::NoReachableEndpoint(_) => true,
            FloodError::Rpc(err) => err.is_connectivity(),
            _ => false,
        }
    }
}

/// Result alias used across the workspace
pub type FloodResult<T> = Result<T, FloodError>;

/// Module tests
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_fee_rejections() {
        assert_eq!(classify_rejection("transaction fee too low"), RejectionKind::FeeTooLow);
        assert_eq!(
            classify_rejection("max fee per gas less than block base fee: address 0x1"),
            RejectionKind::FeeTooLow
        );
        assert_eq!(classify_rejection("transaction underpriced"), RejectionKind::FeeTooLow);
        assert_eq!(
            classify_rejection("replacement transaction underpriced"),
            RejectionKind::ReplacementUnderpriced
        );
    }

    #[test]
    fn test_classify_other_rejections() {
        assert_eq!(classify_rejection("ALREADY KNOWN"), RejectionKind::AlreadyKnown);
        assert_eq!(classify_rejection("nonce too low: next nonce 5"), RejectionKind::NonceTooLow);
        assert_eq!(
            classify_rejection("insufficient funds for gas * price + value"),
            RejectionKind::InsufficientFunds
        );
        assert_eq!(classify_rejection("intrinsic gas too low"), RejectionKind::GasLimit);
        assert_eq!(classify_rejection("execution reverted"), RejectionKind::Other);
    }

    #[test]
    fn test_recovery_actions() {
        assert_eq!(RejectionKind::AlreadyKnown.recovery(), RecoveryAction::TreatAsSubmitted);
        assert_eq!(RejectionKind::FeeTooLow.recovery(), RecoveryAction::RefreshFeesAndRetry);
        assert_eq!(RejectionKind::NonceTooLow.recovery(), RecoveryAction::ResyncNonce);
        assert_eq!(RejectionKind::Other.recovery(), RecoveryAction::Abort);
    }

    #[test]
    fn test_rpc_error_connectivity() {
        assert!(RpcError::Connection("refused".into()).is_connectivity());
        assert!(RpcError::Timeout(Duration::from_secs(5)).is_connectivity());
        let rejected = RpcError::Rejected { code: -32000, message: "fee too low".into() };
        assert!(!rejected.is_connectivity());
        assert_eq!(rejected.rejection(), Some(RejectionKind::FeeTooLow));
    }

    #[test]
    fn test_flood_error_display() {
        let error = FloodError::ConfirmationTimeout { nonce: 7, attempts: 10 };
        assert_eq!(
            error.to_string(),
            "Transaction with nonce 7 not confirmed after 10 rebroadcasts"
        );
        assert!(FloodError::NoEndpoint("default".into()).is_no_endpoint());
        assert!(!FloodError::Cancelled.is_no_endpoint());
    }
}
