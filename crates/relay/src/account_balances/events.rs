use {
    super::AccountBalances,
    crate::{
        chain::{AllowanceQuery, BalanceQuery},
        event_bus::Subscriber,
        notifier::Notifying,
    },
    alloy::primitives::Address,
    anyhow::Result,
    itertools::Itertools,
    model::{
        event::{BlockEnd, Event, EventKind},
        notification::Notification,
    },
    std::sync::Arc,
    tracing::instrument,
};

/// Marks balances and allowances touched by confirmed events as dirty and
/// resyncs them once their block ended.
pub struct BalanceEvents {
    balances: Arc<AccountBalances>,
    notifier: Arc<dyn Notifying>,
    weth: Address,
}

impl BalanceEvents {
    pub const KINDS: &'static [EventKind] = &[
        EventKind::Approval,
        EventKind::Transfer,
        EventKind::WethDeposit,
        EventKind::WethWithdrawal,
        EventKind::EthTransfer,
        EventKind::OrderFilled,
        EventKind::OrderCancelled,
        EventKind::CutoffAll,
        EventKind::CutoffPair,
        EventKind::RingMined,
        EventKind::SubmitRingMethod,
        EventKind::BlockNew,
        EventKind::BlockEnd,
    ];

    pub fn new(
        balances: Arc<AccountBalances>,
        notifier: Arc<dyn Notifying>,
        weth: Address,
    ) -> Self {
        Self {
            balances,
            notifier,
            weth,
        }
    }

    /// The sender of any transaction paid gas for it.
    async fn charge_gas(&self, event: &Event) -> Result<()> {
        match event.tx() {
            Some(tx) => self.invalidate_native(&[tx.from]).await,
            None => Ok(()),
        }
    }

    async fn invalidate_native(&self, owners: &[Address]) -> Result<()> {
        let owners = owners.iter().copied().unique().collect_vec();
        self.balances.invalidate_native(&owners).await?;
        for owner in owners {
            self.notifier.notify(Notification::BalanceUpdate { owner });
        }
        Ok(())
    }

    async fn mark(&self, event: &Event) -> Result<()> {
        let dirty = self.balances.dirty();
        match event {
            Event::Approval(approval) => {
                dirty
                    .mark_allowance(approval.tx.block_number, AllowanceQuery {
                        owner: approval.owner,
                        token: approval.token,
                        spender: approval.spender,
                    })
                    .await
            }
            Event::Transfer(transfer) => {
                dirty
                    .mark_balances(transfer.tx.block_number, &[
                        BalanceQuery {
                            owner: transfer.sender,
                            token: transfer.token,
                        },
                        BalanceQuery {
                            owner: transfer.receiver,
                            token: transfer.token,
                        },
                    ])
                    .await
            }
            Event::WethDeposit(deposit) => {
                dirty
                    .mark_balance(deposit.tx.block_number, deposit.dst, self.weth)
                    .await?;
                self.invalidate_native(&[deposit.dst]).await
            }
            Event::WethWithdrawal(withdrawal) => {
                dirty
                    .mark_balance(withdrawal.tx.block_number, withdrawal.src, self.weth)
                    .await?;
                self.invalidate_native(&[withdrawal.src]).await
            }
            Event::EthTransfer(transfer) => {
                self.invalidate_native(&[transfer.sender, transfer.receiver])
                    .await
            }
            Event::OrderFilled(fill) => {
                let block = fill.tx.block_number;
                dirty
                    .mark_balances(block, &[
                        BalanceQuery {
                            owner: fill.owner,
                            token: fill.token_s,
                        },
                        BalanceQuery {
                            owner: fill.owner,
                            token: fill.token_b,
                        },
                    ])
                    .await?;
                for spender in self.balances.spenders() {
                    dirty
                        .mark_allowance(block, AllowanceQuery {
                            owner: fill.owner,
                            token: fill.token_s,
                            spender: *spender,
                        })
                        .await?;
                }
                Ok(())
            }
            Event::BlockNew(block) => {
                self.balances.observe_block(block.block_number);
                Ok(())
            }
            Event::BlockEnd(end) => {
                self.block_end(end).await;
                Ok(())
            }
            _ => Ok(()),
        }
    }

    #[instrument(skip_all, fields(block = end.block_number))]
    async fn block_end(&self, end: &BlockEnd) {
        match self.balances.resync(end.block_number).await {
            Ok(owners) => {
                tracing::debug!(changed = owners.len(), "resynced balances");
                for owner in owners {
                    self.notifier.notify(Notification::BalanceUpdate { owner });
                }
            }
            // The next block end that touches the same keys retries.
            Err(err) => tracing::warn!(?err, "failed to resync balances"),
        }
        self.notifier
            .notify(Notification::RelayBlockEnd(end.clone()));
    }
}

#[async_trait::async_trait]
impl Subscriber for BalanceEvents {
    async fn on_pending(&self, event: &Event) -> Result<()> {
        self.charge_gas(event).await
    }

    async fn on_failed(&self, event: &Event) -> Result<()> {
        self.charge_gas(event).await
    }

    async fn on_success(&self, event: &Event) -> Result<()> {
        self.charge_gas(event).await?;
        self.mark(event).await
    }
}
