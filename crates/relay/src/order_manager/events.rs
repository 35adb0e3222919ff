use {
    super::OrderManager,
    crate::{cutoff_cache::CutoffKey, database::orders::RingMinedRecord, event_bus::Subscriber},
    anyhow::Result,
    model::{
        event::{Event, EventKind, RingMined, SubmitRingMethod},
        order::OrderStatus,
    },
};

impl OrderManager {
    pub const KINDS: &'static [EventKind] = &[
        EventKind::NewOrder,
        EventKind::OrderFilled,
        EventKind::OrderCancelled,
        EventKind::CutoffAll,
        EventKind::CutoffPair,
        EventKind::RingMined,
        EventKind::SubmitRingMethod,
    ];

    fn relevant(&self, event: &Event) -> bool {
        match event {
            Event::NewOrder(new) => self.accepts(&new.order.protocol),
            _ => event.tx().is_none_or(|tx| self.accepts(&tx.protocol)),
        }
    }

    async fn record_ring(&self, ring: RingMinedRecord) -> Result<()> {
        tracing::debug!(tx = %ring.tx_hash, status = ?ring.status, "ring mined");
        self.ring_mined(&ring).await
    }
}

fn mined(ring: &RingMined) -> RingMinedRecord {
    RingMinedRecord {
        tx_hash: ring.tx.tx_hash,
        block_number: ring.tx.block_number,
        ring_hash: ring.ring_hash,
        ring_index: ring.ring_index,
        miner: ring.miner,
        fee_recipient: ring.fee_recipient,
        status: ring.tx.status,
    }
}

fn submitted(ring: &SubmitRingMethod) -> RingMinedRecord {
    RingMinedRecord {
        tx_hash: ring.tx.tx_hash,
        block_number: ring.tx.block_number,
        ring_hash: ring.ring_hash,
        miner: ring.miner,
        fee_recipient: ring.fee_recipient,
        status: ring.tx.status,
        ..Default::default()
    }
}

#[async_trait::async_trait]
impl Subscriber for OrderManager {
    /// Marks the orders an unconfirmed transaction would change.
    async fn on_pending(&self, event: &Event) -> Result<()> {
        if !self.relevant(event) {
            return Ok(());
        }
        match event {
            Event::OrderCancelled(cancel) => {
                self.mark_pending(
                    &cancel.tx.tx_hash,
                    &[cancel.order_hash],
                    OrderStatus::Cancelling,
                )
                .await?;
            }
            Event::CutoffAll(cutoff) => {
                let key = CutoffKey::all(cutoff.tx.protocol, cutoff.owner);
                self.mark_pending_cutoff(&cutoff.tx.tx_hash, key, cutoff.cutoff)
                    .await?;
            }
            Event::CutoffPair(cutoff) => {
                if let Some(pair) = cutoff.token_pair() {
                    let key = CutoffKey::pair(cutoff.tx.protocol, cutoff.owner, pair);
                    self.mark_pending_cutoff(&cutoff.tx.tx_hash, key, cutoff.cutoff)
                        .await?;
                }
            }
            Event::SubmitRingMethod(ring) => {
                self.record_ring(submitted(ring)).await?;
                self.mark_pending(&ring.tx.tx_hash, &ring.order_hashes, OrderStatus::Pending)
                    .await?;
            }
            Event::RingMined(ring) => self.record_ring(mined(ring)).await?,
            _ => (),
        }
        Ok(())
    }

    /// Restores orders marked by the failed transaction.
    async fn on_failed(&self, event: &Event) -> Result<()> {
        if !self.relevant(event) {
            return Ok(());
        }
        match event {
            Event::OrderCancelled(cancel) => {
                self.revert_pending(&cancel.tx.tx_hash).await?;
            }
            Event::CutoffAll(cutoff) => {
                self.revert_pending(&cutoff.tx.tx_hash).await?;
            }
            Event::CutoffPair(cutoff) => {
                self.revert_pending(&cutoff.tx.tx_hash).await?;
            }
            Event::SubmitRingMethod(ring) => {
                self.revert_pending(&ring.tx.tx_hash).await?;
                self.record_ring(submitted(ring)).await?;
            }
            Event::RingMined(ring) => self.record_ring(mined(ring)).await?,
            _ => (),
        }
        Ok(())
    }

    /// Provisional markers of the transaction get reverted before the
    /// confirmed effect is applied.
    async fn on_success(&self, event: &Event) -> Result<()> {
        if !self.relevant(event) {
            return Ok(());
        }
        match event {
            Event::NewOrder(new) => {
                self.new_order(new).await?;
            }
            Event::OrderFilled(fill) => {
                self.fill(fill).await?;
            }
            Event::OrderCancelled(cancel) => {
                self.revert_pending(&cancel.tx.tx_hash).await?;
                self.cancel(cancel).await?;
            }
            Event::CutoffAll(cutoff) => {
                self.revert_pending(&cutoff.tx.tx_hash).await?;
                self.cutoff_all(cutoff).await?;
            }
            Event::CutoffPair(cutoff) => {
                self.revert_pending(&cutoff.tx.tx_hash).await?;
                self.cutoff_pair(cutoff).await?;
            }
            Event::SubmitRingMethod(ring) => {
                // The fills arrive as separate events.
                self.revert_pending(&ring.tx.tx_hash).await?;
            }
            Event::RingMined(ring) => self.record_ring(mined(ring)).await?,
            _ => (),
        }
        Ok(())
    }
}
