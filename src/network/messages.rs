// src/network/messages.rs
// Textual anti-entropy envelopes exchanged between peers

use crate::error::MessageError;
use crate::ledger::{Block, Hash};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Tip summary advertised in `!latest`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainSummary {
    pub height: u64,
    pub anchor_height: u64,
}

impl ChainSummary {
    /// Whether `other` is strictly ahead on both the sidechain and the anchor chain.
    pub fn is_behind(&self, other: &ChainSummary) -> bool {
        other.height > self.height && other.anchor_height > self.anchor_height
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GossipMessage {
    /// `?blocks`
    RequestLatest,
    /// `?block:<height>`
    RequestBlock(u64),
    /// `?bmm:<hex-commitment>`
    RequestByCommitment(Hash),
    /// `!latest{json}`
    Latest(ChainSummary),
    /// `!block:<height><json>`, or `!block:<json>` when answering `?bmm`.
    Block { height: Option<u64>, block: Block },
}

impl GossipMessage {
    pub fn encode(&self) -> Result<String, MessageError> {
        let s = match self {
            GossipMessage::RequestLatest => "?blocks".to_string(),
            GossipMessage::RequestBlock(h) => format!("?block:{}", h),
            GossipMessage::RequestByCommitment(c) => format!("?bmm:{}", hex::encode(c)),
            GossipMessage::Latest(summary) => format!(
                "!latest{}",
                serde_json::to_string(summary).map_err(|e| MessageError::BadPayload(e.to_string()))?
            ),
            GossipMessage::Block { height, block } => {
                let json = serde_json::to_string(block)
                    .map_err(|e| MessageError::BadPayload(e.to_string()))?;
                match height {
                    Some(h) => format!("!block:{}{}", h, json),
                    None => format!("!block:{}", json),
                }
            }
        };
        Ok(s)
    }

    pub fn is_request(&self) -> bool {
        matches!(
            self,
            GossipMessage::RequestLatest
                | GossipMessage::RequestBlock(_)
                | GossipMessage::RequestByCommitment(_)
        )
    }
}

impl fmt::Display for GossipMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GossipMessage::RequestLatest => write!(f, "?blocks"),
            GossipMessage::RequestBlock(h) => write!(f, "?block:{}", h),
            GossipMessage::RequestByCommitment(c) => write!(f, "?bmm:{}", hex::encode(c)),
            GossipMessage::Latest(s) => write!(
                f,
                "!latest(height={}, anchor={})",
                s.height, s.anchor_height
            ),
            GossipMessage::Block { height, block } => match height {
                Some(h) => write!(f, "!block:{} ({})", h, block.hash_hex()),
                None => write!(f, "!block ({})", block.hash_hex()),
            },
        }
    }
}

impl FromStr for GossipMessage {
    type Err = MessageError;

    fn from_str(msg: &str) -> Result<Self, Self::Err> {
        if msg == "?blocks" {
            return Ok(GossipMessage::RequestLatest);
        }
        if let Some(rest) = msg.strip_prefix("?block:") {
            let h = rest
                .parse::<u64>()
                .map_err(|_| MessageError::BadHeight(msg.chars().take(64).collect()))?;
            return Ok(GossipMessage::RequestBlock(h));
        }
        if let Some(rest) = msg.strip_prefix("?bmm:") {
            let mut c = [0u8; 32];
            hex::decode_to_slice(rest, &mut c)
                .map_err(|e| MessageError::BadCommitment(e.to_string()))?;
            return Ok(GossipMessage::RequestByCommitment(c));
        }
        if let Some(rest) = msg.strip_prefix("!latest") {
            let summary = serde_json::from_str(rest)
                .map_err(|e| MessageError::BadPayload(e.to_string()))?;
            return Ok(GossipMessage::Latest(summary));
        }
        if let Some(rest) = msg.strip_prefix("!block:") {
            let digits = rest.bytes().take_while(u8::is_ascii_digit).count();
            let height = if digits == 0 {
                None
            } else {
                Some(
                    rest[..digits]
                        .parse::<u64>()
                        .map_err(|_| MessageError::BadHeight(rest[..digits].to_string()))?,
                )
            };
            let block = serde_json::from_str(&rest[digits..])
                .map_err(|e| MessageError::BadPayload(e.to_string()))?;
            return Ok(GossipMessage::Block { height, block });
        }
        Err(MessageError::Unknown(msg.chars().take(32).collect()))
    }
}
