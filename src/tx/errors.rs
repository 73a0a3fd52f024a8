//! Classification of node errors returned when sending a raw transaction
//!
//! Nodes only report send failures as free text, and each client family words
//! them differently, so every kind is matched against both the Geth and the
//! Parity/OpenEthereum vocabularies.

use crate::error::TxmError;

use lazy_static::lazy_static;
use regex::Regex;
use std::fmt;

/// What a failed send means for the transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SendErrorKind {
    /// Can never be accepted at any price or nonce
    Fatal,
    /// The nonce was already consumed on chain
    NonceTooLow,
    /// Another transaction with this nonce is pending at a similar price
    ReplacementUnderpriced,
    /// Below the node's absolute minimum price
    TerminallyUnderpriced,
    /// The node is congested; try again later
    TemporarilyUnderpriced,
    /// The node already holds this exact transaction
    AlreadyInMempool,
    InsufficientFunds,
    Unknown,
}

impl SendErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SendErrorKind::Fatal => "fatal",
            SendErrorKind::NonceTooLow => "nonce_too_low",
            SendErrorKind::ReplacementUnderpriced => "replacement_underpriced",
            SendErrorKind::TerminallyUnderpriced => "terminally_underpriced",
            SendErrorKind::TemporarilyUnderpriced => "temporarily_underpriced",
            SendErrorKind::AlreadyInMempool => "already_in_mempool",
            SendErrorKind::InsufficientFunds => "insufficient_funds",
            SendErrorKind::Unknown => "unknown",
        }
    }
}

impl fmt::Display for SendErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

struct Vocabulary {
    nonce_too_low: Regex,
    replacement_underpriced: Regex,
    terminally_underpriced: Regex,
    temporarily_underpriced: Regex,
    already_in_mempool: Regex,
    insufficient_funds: Regex,
    fatal: Regex,
}

fn re(pattern: &str) -> Regex {
    Regex::new(pattern).unwrap()
}

lazy_static! {
    static ref GETH: Vocabulary = Vocabulary {
        nonce_too_low: re(r"(: |^)nonce too low"),
        replacement_underpriced: re(r"(: |^)replacement transaction underpriced"),
        terminally_underpriced: re(
            r"(: |^)(transaction underpriced|max fee per gas less than block base fee)"
        ),
        temporarily_underpriced: re(r"(: |^)(txpool is full|transaction pool is full)"),
        already_in_mempool: re(r"(?i)(: |^)(known transaction|already known)"),
        insufficient_funds: re(
            r"(: |^)(insufficient funds for transfer|insufficient funds for gas \* price \+ value|insufficient balance for transfer)"
        ),
        fatal: re(
            r"(: |^)(exceeds block gas limit|invalid sender|negative value|oversized data|gas uint64 overflow|intrinsic gas too low|nonce too high|max priority fee per gas higher than max fee per gas|tx fee \([0-9.]+ [a-zA-Z]+\) exceeds the configured cap)"
        ),
    };

    static ref PARITY: Vocabulary = Vocabulary {
        nonce_too_low: re(
            r"^(Transaction nonce is too low\. Try incrementing the nonce\.|There is already a transaction with this nonce)"
        ),
        replacement_underpriced: re(
            r"^Transaction gas price \d+wei is too low\. There is another transaction with same nonce in the queue"
        ),
        terminally_underpriced: re(
            r"^Transaction gas price is too low\. It does not satisfy your node's minimal gas price"
        ),
        temporarily_underpriced: re(
            r"^There are too many transactions in the queue\. Your transaction was dropped due to limit\."
        ),
        already_in_mempool: re(r"^Transaction with the same hash was already imported\."),
        insufficient_funds: re(
            r"^(Insufficient funds\. The account you tried to send transaction from does not have enough funds\.|Insufficient balance for transaction\.)"
        ),
        fatal: re(
            r"^(Supplied gas is beyond limit|Transaction is too big|Transaction gas is too low|Invalid signature|Recipient is banned in local queue|Sender is banned in local queue|Code is banned in local queue|Transaction is not permitted|Transaction nonce is too high)"
        ),
    };

    static ref RECEIPT_NOT_READY: Regex =
        re(r"missing required field 'transactionHash'|missing field `transactionHash`");
}

impl Vocabulary {
    /// Replacement-underpriced is checked ahead of terminally-underpriced
    /// since both mention an underpriced transaction.
    fn classify(&self, message: &str) -> Option<SendErrorKind> {
        let checks = [
            (&self.already_in_mempool, SendErrorKind::AlreadyInMempool),
            (&self.nonce_too_low, SendErrorKind::NonceTooLow),
            (&self.replacement_underpriced, SendErrorKind::ReplacementUnderpriced),
            (&self.terminally_underpriced, SendErrorKind::TerminallyUnderpriced),
            (&self.temporarily_underpriced, SendErrorKind::TemporarilyUnderpriced),
            (&self.insufficient_funds, SendErrorKind::InsufficientFunds),
            (&self.fatal, SendErrorKind::Fatal),
        ];
        checks
            .into_iter()
            .find(|(pattern, _)| pattern.is_match(message))
            .map(|(_, kind)| kind)
    }
}

/// Classify a node's error message
pub fn classify(message: &str) -> SendErrorKind {
    let message = message.trim();
    GETH.classify(message)
        .or_else(|| PARITY.classify(message))
        .unwrap_or(SendErrorKind::Unknown)
}

/// Classify a send error. Only messages returned by the node carry meaning;
/// transport failures and timeouts are always [`SendErrorKind::Unknown`].
pub fn from_error(err: &TxmError) -> SendErrorKind {
    match err {
        TxmError::Rpc(message) => classify(message),
        _ => SendErrorKind::Unknown,
    }
}

/// Some nodes answer a receipt query for a just-mined transaction before the
/// receipt is fully built. That means "no receipt yet", not failure.
pub fn is_receipt_not_ready(err: &TxmError) -> bool {
    match err {
        TxmError::Rpc(message) => RECEIPT_NOT_READY.is_match(message),
        TxmError::ChainConnection { message, .. } => RECEIPT_NOT_READY.is_match(message),
        _ => false,
    }
}
