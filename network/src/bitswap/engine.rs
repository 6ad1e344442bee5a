use std::sync::Arc;

use anyhow::Result;

use crate::bitswap::config::BitswapConfig;
use crate::bitswap::message::{BitswapMessage, WantType};
use crate::store::BlockStore;
use crate::types::PeerId;

/// Answers want-lists of remote peers from the local block store.
pub struct BitswapEngine {
    store: Arc<dyn BlockStore>,
    small_block_threshold: usize,
    send_unsolicited_dont_have: bool,
}

impl BitswapEngine {
    pub fn new(config: &BitswapConfig, store: Arc<dyn BlockStore>) -> Self {
        Self {
            store,
            small_block_threshold: config.small_block_threshold.as_u64() as usize,
            send_unsolicited_dont_have: config.send_unsolicited_dont_have,
        }
    }

    /// Builds a reply to the want-list of the message.
    ///
    /// Returns `None` if there is nothing to say.
    #[tracing::instrument(level = "trace", skip_all, fields(%peer_id))]
    pub fn handle_wantlist(
        &self,
        peer_id: &PeerId,
        message: &BitswapMessage,
    ) -> Result<Option<BitswapMessage>> {
        let entries = message
            .wantlist()
            .filter(|entry| !entry.cancel)
            .collect::<Vec<_>>();
        if entries.is_empty() {
            return Ok(None);
        }

        let cids = entries.iter().map(|entry| entry.cid).collect::<Vec<_>>();
        let sizes = self.store.sizes_of(&cids)?;

        let mut reply = BitswapMessage::new(false);
        let mut to_send = Vec::new();
        for (entry, size) in entries.iter().zip(sizes) {
            match size {
                None => {
                    if entry.send_dont_have || self.send_unsolicited_dont_have {
                        reply.add_dont_have(entry.cid);
                    }
                }
                Some(size) => {
                    let is_want_block =
                        entry.want_type == WantType::Block || size <= self.small_block_threshold;
                    if is_want_block {
                        to_send.push(entry.cid);
                    } else {
                        reply.add_have(entry.cid);
                    }
                }
            }
        }

        for (cid, block) in to_send.iter().zip(self.store.get_blocks(&to_send)?) {
            match block {
                Some(block) => reply.add_block(block),
                // Deleted in the meantime.
                None => reply.add_dont_have(*cid),
            }
        }

        tracing::trace!(
            blocks = reply.blocks().len(),
            presences = reply.presences().len(),
            "prepared reply",
        );

        Ok((!reply.is_empty()).then_some(reply))
    }
}
