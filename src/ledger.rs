//! Budget ledger: append-only journal plus a single derived account row.
//!
//! Every mutation goes through [`LedgerTx`], which borrows the account and journal trees
//! of an open sled transaction. A caller that also touches requests or inventory passes
//! those trees in the same transaction, so a journal row can never outlive the request
//! change it belongs to.
use super::error::{AbortOnErr, OrderError, OrderResult, TxResult, abort};
use super::types::{Money, TimeStamp};
use super::utils;
use chrono::Utc;
use sled::Transactional;
use sled::transaction::TransactionalTree;

pub const ACCOUNT_TREE: &str = "ledger_account";
pub const JOURNAL_TREE: &str = "ledger_journal";
pub const APPLIED_OPS_TREE: &str = "ledger_applied_ops";

const ACCOUNT_KEY: &[u8] = b"account";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, minicbor::Encode, minicbor::Decode)]
pub enum EntryType {
    #[n(0)]
    DebitOrder,
    #[n(1)]
    CreditRejected,
    #[n(2)]
    CreditCancelled,
    #[n(3)]
    CreditDeleted,
    #[n(4)]
    CreditDeliveryProfit,
    #[n(5)]
    Adjustment,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub enum Direction {
    #[n(0)]
    Debit,
    #[n(1)]
    Credit,
}

/// Why a request's debit is being handed back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub enum CreditReason {
    #[n(0)]
    Rejected,
    #[n(1)]
    Cancelled,
    #[n(2)]
    Deleted,
}

impl CreditReason {
    fn entry_type(self) -> EntryType {
        match self {
            CreditReason::Rejected => EntryType::CreditRejected,
            CreditReason::Cancelled => EntryType::CreditCancelled,
            CreditReason::Deleted => EntryType::CreditDeleted,
        }
    }
}

/// A ledger mutation, as planned by the state machine or sent to a remote ledger.
#[derive(Debug, Clone, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub enum LedgerOp {
    #[n(0)]
    Deduct {
        #[n(0)]
        amount: Money,
    },
    #[n(1)]
    Restore {
        #[n(0)]
        amount: Money,
        #[n(1)]
        reason: CreditReason,
    },
    #[n(2)]
    AddProfit {
        #[n(0)]
        amount: Money,
    },
    #[n(3)]
    Adjust {
        #[n(0)]
        delta: Money,
    },
}

/// Context recorded on every journal row.
#[derive(Debug, Clone, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub struct EntryContext {
    #[n(0)]
    pub request_id: Option<String>,
    #[n(1)]
    pub actor: String,
    #[n(2)]
    pub description: String,
}

impl EntryContext {
    pub fn new(request_id: Option<&str>, actor: &str, description: impl Into<String>) -> Self {
        Self {
            request_id: request_id.map(str::to_string),
            actor: actor.to_string(),
            description: description.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub struct LedgerAccount {
    #[n(0)]
    pub current_revenue: Money,
    #[n(1)]
    pub available_budget: Money,
    #[n(2)]
    pub total_spent: Money,
    #[n(3)]
    pub last_updated: TimeStamp<Utc>,
    #[n(4)]
    pub transaction_count: u64, // also the next journal sequence
    #[n(5)]
    pub head_digest: String,
}

impl LedgerAccount {
    fn empty() -> Self {
        Self {
            current_revenue: Money::ZERO,
            available_budget: Money::ZERO,
            total_spent: Money::ZERO,
            last_updated: TimeStamp::new(),
            transaction_count: 0,
            head_digest: String::new(),
        }
    }

    /// Balance-only comparison; timestamps and digests are bookkeeping.
    pub fn same_balances(&self, other: &LedgerAccount) -> bool {
        self.current_revenue == other.current_revenue
            && self.available_budget == other.available_budget
            && self.total_spent == other.total_spent
            && self.transaction_count == other.transaction_count
    }
}

#[derive(Debug, Clone, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub struct LedgerTransaction {
    #[n(0)]
    pub seq: u64,
    #[n(1)]
    pub id: String, // bech32 encoded uuid7, "ltx_" prefix
    #[n(2)]
    pub entry_type: EntryType,
    #[n(3)]
    pub direction: Direction,
    #[n(4)]
    pub amount: Money, // always positive
    #[n(5)]
    pub request_id: Option<String>,
    #[n(6)]
    pub actor: String,
    #[n(7)]
    pub created_at: TimeStamp<Utc>,
    #[n(8)]
    pub description: String,
    #[n(9)]
    pub balance_after: Money,
    #[n(10)]
    pub reverses: Option<u64>,
    #[n(11)]
    pub spent_effect: Money, // signed change applied to total_spent
    #[n(12)]
    pub digest: String,
}

impl LedgerTransaction {
    /// sha256 over the previous row's digest and this row encoded without its own digest.
    fn compute_digest(&self, prev_digest: &str) -> OrderResult<String> {
        let mut unsigned = self.clone();
        unsigned.digest = String::new();
        let mut bytes = prev_digest.as_bytes().to_vec();
        bytes.extend(utils::encode(&unsigned)?);
        Ok(sha256::digest(&bytes))
    }

    /// Signed effect on the available budget.
    pub fn budget_effect(&self) -> Money {
        match self.direction {
            Direction::Credit => self.amount,
            Direction::Debit => Money::new(-self.amount.amount()),
        }
    }
}

fn journal_key(seq: u64) -> [u8; 8] {
    seq.to_be_bytes()
}

/// Effects of one row on the account. Shared by live writes and by replay so both paths
/// produce identical balances. Returns the signed change applied to `total_spent`.
fn apply_effects(
    account: &mut LedgerAccount,
    row: &LedgerTransaction,
    reversed: Option<&LedgerTransaction>,
) -> OrderResult<Money> {
    let spent_before = account.total_spent;
    match (row.entry_type, reversed) {
        (EntryType::Adjustment, Some(original)) => {
            // undo exactly what the original row did
            account.available_budget = account.available_budget.try_sub(original.budget_effect())?;
            account.total_spent = account
                .total_spent
                .try_sub(original.spent_effect)?
                .max(Money::ZERO);
            if original.entry_type == EntryType::CreditDeliveryProfit {
                account.current_revenue =
                    account.current_revenue.saturating_sub_floor(original.amount);
            }
        }
        (EntryType::Adjustment, None) => {
            account.available_budget = account.available_budget.try_add(row.budget_effect())?;
        }
        (EntryType::DebitOrder, _) => {
            account.available_budget = account.available_budget.try_sub(row.amount)?;
            account.total_spent = account.total_spent.try_add(row.amount)?;
        }
        (EntryType::CreditRejected | EntryType::CreditCancelled | EntryType::CreditDeleted, _) => {
            account.available_budget = account.available_budget.try_add(row.amount)?;
            account.total_spent = account.total_spent.saturating_sub_floor(row.amount);
        }
        (EntryType::CreditDeliveryProfit, _) => {
            account.available_budget = account.available_budget.try_add(row.amount)?;
            account.total_spent = account.total_spent.saturating_sub_floor(row.amount);
            account.current_revenue = account.current_revenue.try_add(row.amount)?;
        }
    }
    account.total_spent.try_sub(spent_before)
}

/// Ledger operations bound to an open sled transaction.
pub(crate) struct LedgerTx<'a> {
    pub account: &'a TransactionalTree,
    pub journal: &'a TransactionalTree,
}

impl<'a> LedgerTx<'a> {
    pub fn new(account: &'a TransactionalTree, journal: &'a TransactionalTree) -> Self {
        Self { account, journal }
    }

    pub fn load_account(&self) -> TxResult<LedgerAccount> {
        match self.account.get(ACCOUNT_KEY)? {
            Some(bytes) => utils::decode(&bytes).or_abort(),
            None => Ok(LedgerAccount::empty()),
        }
    }

    pub fn apply(&self, op: &LedgerOp, ctx: &EntryContext) -> TxResult<LedgerTransaction> {
        match op {
            LedgerOp::Deduct { amount } => self.deduct(*amount, ctx),
            LedgerOp::Restore { amount, reason } => self.restore(*amount, *reason, ctx),
            LedgerOp::AddProfit { amount } => self.add_profit(*amount, ctx),
            LedgerOp::Adjust { delta } => self.adjust(*delta, ctx),
        }
    }

    pub fn deduct(&self, amount: Money, ctx: &EntryContext) -> TxResult<LedgerTransaction> {
        ensure_positive(amount)?;
        let account = self.load_account()?;
        if amount > account.available_budget {
            return abort(OrderError::InsufficientBudget {
                requested: amount,
                available: account.available_budget,
            });
        }
        self.append(account, EntryType::DebitOrder, Direction::Debit, amount, None, ctx)
    }

    pub fn restore(
        &self,
        amount: Money,
        reason: CreditReason,
        ctx: &EntryContext,
    ) -> TxResult<LedgerTransaction> {
        ensure_positive(amount)?;
        let account = self.load_account()?;
        self.append(account, reason.entry_type(), Direction::Credit, amount, None, ctx)
    }

    pub fn add_profit(&self, amount: Money, ctx: &EntryContext) -> TxResult<LedgerTransaction> {
        ensure_positive(amount)?;
        let account = self.load_account()?;
        self.append(
            account,
            EntryType::CreditDeliveryProfit,
            Direction::Credit,
            amount,
            None,
            ctx,
        )
    }

    pub fn adjust(&self, delta: Money, ctx: &EntryContext) -> TxResult<LedgerTransaction> {
        ensure_positive(delta.abs())?;
        let account = self.load_account()?;
        let direction = if delta.is_negative() {
            if delta.abs() > account.available_budget {
                return abort(OrderError::InsufficientBudget {
                    requested: delta.abs(),
                    available: account.available_budget,
                });
            }
            Direction::Debit
        } else {
            Direction::Credit
        };
        self.append(account, EntryType::Adjustment, direction, delta.abs(), None, ctx)
    }

    /// Appends an ADJUSTMENT that undoes row `seq` exactly.
    pub fn reverse(&self, seq: u64, ctx: &EntryContext) -> TxResult<LedgerTransaction> {
        let original: LedgerTransaction = match self.journal.get(journal_key(seq))? {
            Some(bytes) => utils::decode(&bytes).or_abort()?,
            None => {
                return abort(OrderError::StorageFailure(format!(
                    "journal row {seq} does not exist"
                )));
            }
        };
        let account = self.load_account()?;
        let direction = match original.direction {
            Direction::Debit => Direction::Credit,
            Direction::Credit => Direction::Debit,
        };
        if direction == Direction::Debit && original.amount > account.available_budget {
            return abort(OrderError::InsufficientBudget {
                requested: original.amount,
                available: account.available_budget,
            });
        }
        self.append(
            account,
            EntryType::Adjustment,
            direction,
            original.amount,
            Some(&original),
            ctx,
        )
    }

    fn append(
        &self,
        mut account: LedgerAccount,
        entry_type: EntryType,
        direction: Direction,
        amount: Money,
        reversed: Option<&LedgerTransaction>,
        ctx: &EntryContext,
    ) -> TxResult<LedgerTransaction> {
        let id = utils::new_uuid_to_bech32("ltx_")
            .map_err(|e| OrderError::StorageFailure(format!("id generation: {e}")))
            .or_abort()?;
        let created_at = TimeStamp::not_before(&account.last_updated);

        let mut row = LedgerTransaction {
            seq: account.transaction_count,
            id,
            entry_type,
            direction,
            amount,
            request_id: ctx.request_id.clone(),
            actor: ctx.actor.clone(),
            created_at: created_at.clone(),
            description: ctx.description.clone(),
            balance_after: Money::ZERO,
            reverses: reversed.map(|r| r.seq),
            spent_effect: Money::ZERO,
            digest: String::new(),
        };
        row.spent_effect = apply_effects(&mut account, &row, reversed).or_abort()?;
        row.balance_after = account.available_budget;
        row.digest = row.compute_digest(&account.head_digest).or_abort()?;

        account.transaction_count += 1;
        account.last_updated = created_at;
        account.head_digest = row.digest.clone();

        self.journal
            .insert(&journal_key(row.seq)[..], utils::encode(&row).or_abort()?)?;
        self.account
            .insert(ACCOUNT_KEY, utils::encode(&account).or_abort()?)?;
        Ok(row)
    }
}

fn ensure_positive(amount: Money) -> TxResult<()> {
    if !amount.is_positive() {
        return abort(OrderError::NonPositiveAmount(amount));
    }
    Ok(())
}

/// Outcome of [`Ledger::verify`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerAudit {
    pub rows: u64,
    pub replayed: LedgerAccount,
    pub stored: LedgerAccount,
}

/// Read side of the ledger plus standalone units of work (manual adjustments and the
/// idempotent entry points used when the ledger is served to another process).
#[derive(Clone)]
pub struct Ledger {
    account: sled::Tree,
    journal: sled::Tree,
    applied_ops: sled::Tree,
}

impl Ledger {
    pub fn open(db: &sled::Db) -> OrderResult<Self> {
        Ok(Self {
            account: db.open_tree(ACCOUNT_TREE)?,
            journal: db.open_tree(JOURNAL_TREE)?,
            applied_ops: db.open_tree(APPLIED_OPS_TREE)?,
        })
    }

    pub fn account_tree(&self) -> &sled::Tree {
        &self.account
    }

    pub fn journal_tree(&self) -> &sled::Tree {
        &self.journal
    }

    /// Records the opening budget on a fresh ledger. No-op once any row exists.
    pub fn initialize(&self, opening_budget: Money, actor: &str) -> OrderResult<LedgerAccount> {
        let account = (&self.account, &self.journal).transaction(
            |(account, journal)| -> TxResult<LedgerAccount> {
                let ledger = LedgerTx::new(account, journal);
                let current = ledger.load_account()?;
                if current.transaction_count == 0 && opening_budget.is_positive() {
                    let ctx = EntryContext::new(None, actor, "opening budget");
                    ledger.adjust(opening_budget, &ctx)?;
                    return ledger.load_account();
                }
                Ok(current)
            },
        )?;
        Ok(account)
    }

    pub fn account(&self) -> OrderResult<LedgerAccount> {
        match self.account.get(ACCOUNT_KEY)? {
            Some(bytes) => utils::decode(&bytes),
            None => Ok(LedgerAccount::empty()),
        }
    }

    /// Manual correction, positive or negative.
    pub fn adjust(&self, delta: Money, actor: &str, reason: &str) -> OrderResult<LedgerTransaction> {
        if actor.trim().is_empty() {
            return Err(OrderError::MissingActor);
        }
        let row = (&self.account, &self.journal).transaction(
            |(account, journal)| -> TxResult<LedgerTransaction> {
                LedgerTx::new(account, journal).adjust(delta, &EntryContext::new(None, actor, reason))
            },
        )?;
        tracing::info!(seq = row.seq, delta = %delta, actor, balance_after = %row.balance_after, "ledger adjusted");
        Ok(row)
    }

    /// Newest first.
    pub fn list_transactions(&self, limit: usize) -> OrderResult<Vec<LedgerTransaction>> {
        let mut out = Vec::with_capacity(limit.min(256));
        for entry in self.journal.iter().rev().take(limit) {
            let (_, bytes) = entry?;
            out.push(utils::decode(&bytes)?);
        }
        Ok(out)
    }

    pub fn transactions_for(&self, request_id: &str) -> OrderResult<Vec<LedgerTransaction>> {
        let mut out = vec![];
        for entry in self.journal.iter() {
            let (_, bytes) = entry?;
            let row: LedgerTransaction = utils::decode(&bytes)?;
            if row.request_id.as_deref() == Some(request_id) {
                out.push(row);
            }
        }
        Ok(out)
    }

    /// Rebuilds the account by replaying the journal from zero, checking the balance and
    /// digest chains on the way.
    pub fn replay(&self) -> OrderResult<LedgerAccount> {
        let mut account = LedgerAccount::empty();
        let mut rows: Vec<LedgerTransaction> = vec![];

        for entry in self.journal.iter() {
            let (_, bytes) = entry?;
            let row: LedgerTransaction = utils::decode(&bytes)?;
            if row.seq != account.transaction_count {
                return Err(OrderError::StorageFailure(format!(
                    "journal gap: expected seq {}, found {}",
                    account.transaction_count, row.seq
                )));
            }
            if row.compute_digest(&account.head_digest)? != row.digest {
                return Err(OrderError::StorageFailure(format!(
                    "digest mismatch at seq {}",
                    row.seq
                )));
            }
            let reversed = match row.reverses {
                Some(seq) => Some(rows.get(seq as usize).ok_or_else(|| {
                    OrderError::StorageFailure(format!("seq {} reverses unknown row {seq}", row.seq))
                })?),
                None => None,
            };
            let spent_effect = apply_effects(&mut account, &row, reversed)?;
            if account.available_budget != row.balance_after || spent_effect != row.spent_effect {
                return Err(OrderError::StorageFailure(format!(
                    "balance_after mismatch at seq {}: journal {}, replay {}",
                    row.seq, row.balance_after, account.available_budget
                )));
            }
            account.transaction_count += 1;
            account.last_updated = row.created_at.clone();
            account.head_digest = row.digest.clone();
            rows.push(row);
        }
        Ok(account)
    }

    /// Replays the journal and compares it with the stored account row.
    pub fn verify(&self) -> OrderResult<LedgerAudit> {
        let replayed = self.replay()?;
        let stored = self.account()?;
        if !replayed.same_balances(&stored) || replayed.head_digest != stored.head_digest {
            return Err(OrderError::StorageFailure(format!(
                "stored account diverges from journal: stored budget {}, replayed {}",
                stored.available_budget, replayed.available_budget
            )));
        }
        Ok(LedgerAudit {
            rows: replayed.transaction_count,
            replayed,
            stored,
        })
    }

    /// Applies `op` once per `op_id`. A repeated call returns the row recorded the
    /// first time; an op id that was already compensated is refused.
    pub fn apply_once(
        &self,
        op_id: &str,
        op: &LedgerOp,
        ctx: &EntryContext,
    ) -> OrderResult<LedgerTransaction> {
        let reverted_key = format!("{op_id}:reverted");
        let row = (&self.account, &self.journal, &self.applied_ops).transaction(
            |(account, journal, applied)| -> TxResult<LedgerTransaction> {
                let ledger = LedgerTx::new(account, journal);
                if applied.get(reverted_key.as_bytes())?.is_some() {
                    return abort(OrderError::StorageFailure(format!(
                        "op {op_id} was already compensated"
                    )));
                }
                if let Some(seq) = applied.get(op_id.as_bytes())? {
                    let seq = u64::from_be_bytes(seq_bytes(&seq).or_abort()?);
                    return match journal.get(journal_key(seq))? {
                        Some(bytes) => utils::decode(&bytes).or_abort(),
                        None => abort(OrderError::StorageFailure(format!(
                            "op {op_id} points at missing row {seq}"
                        ))),
                    };
                }
                let row = ledger.apply(op, ctx)?;
                applied.insert(op_id.as_bytes(), journal_key(row.seq).to_vec())?;
                Ok(row)
            },
        )?;
        Ok(row)
    }

    /// Undoes the row recorded for `op_id`. Unknown or already reverted ids are no-ops.
    pub fn revert(&self, op_id: &str, actor: &str) -> OrderResult<Option<LedgerTransaction>> {
        let reverted_key = format!("{op_id}:reverted");
        let row = (&self.account, &self.journal, &self.applied_ops).transaction(
            |(account, journal, applied)| -> TxResult<Option<LedgerTransaction>> {
                let Some(seq) = applied.get(op_id.as_bytes())? else {
                    // tombstone so a late apply of this op id is refused
                    applied.insert(reverted_key.as_bytes(), Vec::<u8>::new())?;
                    return Ok(None);
                };
                if applied.get(reverted_key.as_bytes())?.is_some() {
                    return Ok(None);
                }
                let seq = u64::from_be_bytes(seq_bytes(&seq).or_abort()?);
                let ctx = EntryContext::new(None, actor, format!("compensation for op {op_id}"));
                let row = LedgerTx::new(account, journal).reverse(seq, &ctx)?;
                applied.insert(reverted_key.as_bytes(), journal_key(row.seq).to_vec())?;
                Ok(Some(row))
            },
        )?;
        if let Some(row) = &row {
            tracing::warn!(op_id, seq = row.seq, amount = %row.amount, "ledger op reverted");
        }
        Ok(row)
    }

    /// Whether `op_id` was reverted (or refused before it ever applied).
    pub fn is_reverted(&self, op_id: &str) -> OrderResult<bool> {
        Ok(self
            .applied_ops
            .contains_key(format!("{op_id}:reverted").as_bytes())?)
    }
}

fn seq_bytes(raw: &[u8]) -> OrderResult<[u8; 8]> {
    raw.try_into()
        .map_err(|_| OrderError::StorageFailure("corrupt applied-op entry".into()))
}
