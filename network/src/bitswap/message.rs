use bytes::Bytes;
use indexmap::IndexMap;

use crate::proto::bitswap as proto;
use crate::types::{Block, Cid, CidError, Prefix};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WantType {
    Block,
    Have,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Presence {
    Have,
    DontHave,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub cid: Cid,
    /// Higher is more urgent.
    pub priority: i32,
    pub want_type: WantType,
    pub cancel: bool,
    pub send_dont_have: bool,
}

/// A want-list with block payloads and presences, keyed by [`Cid`].
#[derive(Debug, Clone, Default)]
pub struct BitswapMessage {
    full: bool,
    wantlist: IndexMap<Cid, Entry>,
    blocks: IndexMap<Cid, Block>,
    presences: IndexMap<Cid, Presence>,
    pending_bytes: i32,
}

impl BitswapMessage {
    pub fn new(full: bool) -> Self {
        Self {
            full,
            ..Default::default()
        }
    }

    pub fn is_full(&self) -> bool {
        self.full
    }

    pub fn is_empty(&self) -> bool {
        self.wantlist.is_empty() && self.blocks.is_empty() && self.presences.is_empty()
    }

    pub fn wantlist(&self) -> impl ExactSizeIterator<Item = &Entry> {
        self.wantlist.values()
    }

    pub fn entry(&self, cid: &Cid) -> Option<&Entry> {
        self.wantlist.get(cid)
    }

    pub fn blocks(&self) -> impl ExactSizeIterator<Item = &Block> {
        self.blocks.values()
    }

    pub fn presences(&self) -> impl ExactSizeIterator<Item = (&Cid, Presence)> {
        self.presences.iter().map(|(cid, presence)| (cid, *presence))
    }

    pub fn pending_bytes(&self) -> i32 {
        self.pending_bytes
    }

    pub fn set_pending_bytes(&mut self, pending_bytes: i32) {
        self.pending_bytes = pending_bytes;
    }

    /// Adds a want entry or merges it into an existing one.
    ///
    /// A want-block is never downgraded to a want-have. The priority is only
    /// replaced by an entry of the same type.
    pub fn add_entry(&mut self, cid: Cid, priority: i32, want_type: WantType, send_dont_have: bool) {
        self.add_entry_ext(cid, priority, want_type, false, send_dont_have);
    }

    /// Marks the want for the block as cancelled. Cancellation is never undone.
    pub fn cancel(&mut self, cid: Cid) {
        self.add_entry_ext(cid, 0, WantType::Block, true, false);
    }

    fn add_entry_ext(
        &mut self,
        cid: Cid,
        priority: i32,
        want_type: WantType,
        cancel: bool,
        send_dont_have: bool,
    ) {
        match self.wantlist.entry(cid) {
            indexmap::map::Entry::Occupied(mut entry) => {
                let entry = entry.get_mut();
                if entry.want_type == want_type {
                    entry.priority = priority;
                }
                entry.cancel |= cancel;
                entry.send_dont_have |= send_dont_have;
                if want_type == WantType::Block {
                    entry.want_type = WantType::Block;
                }
            }
            indexmap::map::Entry::Vacant(entry) => {
                entry.insert(Entry {
                    cid,
                    priority,
                    want_type,
                    cancel,
                    send_dont_have,
                });
            }
        }
    }

    /// Adds a block payload, replacing any presence for it.
    pub fn add_block(&mut self, block: Block) {
        let cid = *block.cid();
        self.presences.shift_remove(&cid);
        self.blocks.insert(cid, block);
    }

    pub fn add_have(&mut self, cid: Cid) {
        self.add_presence(cid, Presence::Have);
    }

    pub fn add_dont_have(&mut self, cid: Cid) {
        self.add_presence(cid, Presence::DontHave);
    }

    fn add_presence(&mut self, cid: Cid, presence: Presence) {
        if !self.blocks.contains_key(&cid) {
            self.presences.insert(cid, presence);
        }
    }

    pub fn to_proto(&self) -> proto::Message {
        proto::Message {
            wantlist: proto::Wantlist {
                entries: self
                    .wantlist
                    .values()
                    .map(|entry| proto::WantlistEntry {
                        cid: Bytes::from(entry.cid.to_bytes()),
                        priority: entry.priority,
                        cancel: entry.cancel,
                        want_type: match entry.want_type {
                            WantType::Block => proto::WANT_TYPE_BLOCK,
                            WantType::Have => proto::WANT_TYPE_HAVE,
                        },
                        send_dont_have: entry.send_dont_have,
                    })
                    .collect(),
                full: self.full,
            },
            blocks: self
                .blocks
                .values()
                .map(|block| proto::BlockPayload {
                    prefix: Bytes::from(block.cid().prefix().to_bytes()),
                    data: block.data().clone(),
                })
                .collect(),
            block_presences: self
                .presences
                .iter()
                .map(|(cid, presence)| proto::BlockPresence {
                    cid: Bytes::from(cid.to_bytes()),
                    presence: match presence {
                        Presence::Have => proto::PRESENCE_HAVE,
                        Presence::DontHave => proto::PRESENCE_DONT_HAVE,
                    },
                })
                .collect(),
            pending_bytes: self.pending_bytes,
        }
    }

    /// Parses the wire message. Block ids are recomputed from the payload.
    pub fn from_proto(message: proto::Message) -> Result<Self, MessageError> {
        let mut result = Self::new(message.wantlist.full);

        for entry in message.wantlist.entries {
            let want_type = match entry.want_type {
                proto::WANT_TYPE_BLOCK => WantType::Block,
                proto::WANT_TYPE_HAVE => WantType::Have,
                other => return Err(MessageError::InvalidWantType(other)),
            };
            let cid = Cid::from_bytes(&entry.cid)?;
            result.add_entry_ext(
                cid,
                entry.priority,
                want_type,
                entry.cancel,
                entry.send_dont_have,
            );
        }

        for payload in message.blocks {
            let cid = Prefix::from_bytes(&payload.prefix)?.sum(&payload.data)?;
            result.add_block(Block::new_unchecked(cid, payload.data));
        }

        for presence in message.block_presences {
            let cid = Cid::from_bytes(&presence.cid)?;
            match presence.presence {
                proto::PRESENCE_HAVE => result.add_have(cid),
                proto::PRESENCE_DONT_HAVE => result.add_dont_have(cid),
                other => return Err(MessageError::InvalidPresence(other)),
            }
        }

        result.pending_bytes = message.pending_bytes;
        Ok(result)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum MessageError {
    #[error("invalid content id")]
    InvalidCid(#[from] CidError),
    #[error("unknown want type {0}")]
    InvalidWantType(u32),
    #[error("unknown block presence {0}")]
    InvalidPresence(u32),
    #[error("malformed message")]
    InvalidMessage(#[from] tl_proto::TlError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Codec;

    fn cid(data: &[u8]) -> Cid {
        Cid::for_data(Codec::RAW, data)
    }

    #[test]
    fn want_block_overrides_want_have() {
        let mut message = BitswapMessage::new(false);
        message.add_entry(cid(b"x"), 1, WantType::Have, false);
        message.add_entry(cid(b"x"), 5, WantType::Block, false);
        assert_eq!(message.wantlist().len(), 1);

        let entry = message.entry(&cid(b"x")).unwrap();
        assert_eq!(entry.want_type, WantType::Block);
        // Types differed so the priority is kept.
        assert_eq!(entry.priority, 1);

        message.add_entry(cid(b"x"), 7, WantType::Have, false);
        let entry = message.entry(&cid(b"x")).unwrap();
        assert_eq!(entry.want_type, WantType::Block);
        assert_eq!(entry.priority, 1);

        message.add_entry(cid(b"x"), 9, WantType::Block, false);
        assert_eq!(message.entry(&cid(b"x")).unwrap().priority, 9);
    }

    #[test]
    fn cancel_and_dont_have_are_sticky() {
        let mut message = BitswapMessage::new(false);
        message.add_entry(cid(b"x"), 1, WantType::Have, true);
        message.cancel(cid(b"x"));
        message.add_entry(cid(b"x"), 1, WantType::Have, false);

        let entry = message.entry(&cid(b"x")).unwrap();
        assert!(entry.cancel);
        assert!(entry.send_dont_have);
    }

    #[test]
    fn block_replaces_presence() {
        let block = Block::new(Codec::RAW, Bytes::from_static(b"data"));

        let mut message = BitswapMessage::new(false);
        message.add_have(*block.cid());
        message.add_block(block.clone());
        assert_eq!(message.presences().len(), 0);

        message.add_dont_have(*block.cid());
        assert_eq!(message.presences().len(), 0);
        assert_eq!(message.blocks().next(), Some(&block));
    }

    #[test]
    fn wire_form_is_lossless() {
        let block_a = Block::new(Codec::RAW, Bytes::from_static(b"first block"));
        let block_b = Block::new(Codec::DAG_PB, Bytes::from_static(b"second block"));

        let mut message = BitswapMessage::new(true);
        message.add_entry(cid(b"a"), 10, WantType::Block, true);
        message.add_entry(cid(b"b"), -3, WantType::Have, false);
        message.cancel(cid(b"c"));
        message.add_block(block_a.clone());
        message.add_block(block_b.clone());
        message.add_have(cid(b"d"));
        message.set_pending_bytes(42);

        let bytes = tl_proto::serialize(message.to_proto());
        let parsed = tl_proto::deserialize::<proto::Message>(&bytes).unwrap();
        let parsed = BitswapMessage::from_proto(parsed).unwrap();

        assert!(parsed.is_full());
        assert_eq!(parsed.pending_bytes(), 42);
        assert_eq!(
            parsed.wantlist().cloned().collect::<Vec<_>>(),
            message.wantlist().cloned().collect::<Vec<_>>(),
        );
        assert_eq!(parsed.blocks().cloned().collect::<Vec<_>>(), vec![
            block_a, block_b
        ]);
        assert_eq!(parsed.presences().collect::<Vec<_>>(), vec![(
            &cid(b"d"),
            Presence::Have
        )]);
    }

    #[test]
    fn unknown_want_type_is_rejected() {
        let mut raw = BitswapMessage::new(false);
        raw.add_entry(cid(b"a"), 1, WantType::Have, false);
        let mut raw = raw.to_proto();
        raw.wantlist.entries[0].want_type = 7;

        assert!(matches!(
            BitswapMessage::from_proto(raw),
            Err(MessageError::InvalidWantType(7))
        ));
    }
}
