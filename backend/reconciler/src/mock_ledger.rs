//! In-memory [`LedgerClient`] for tests and local development.
//!
//! Keeps an escrow book that applies the same [`escrow_rules`] as the
//! on-ledger contract, emits the same events, and lets callers inject
//! failures per operation or stall confirmations to exercise the degraded
//! paths of the reconciler.
//!
//! Lock errors (poisoned mutex) are mapped to `LedgerError::Network` without
//! panicking.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use sha2::{Digest, Sha256};

use crate::events::{EventEnvelope, LedgerEvent};
use crate::ledger::{
    Confirmation, ContributeRequest, DeployRequest, EscrowSnapshot, EventCursor, EventPage,
    LedgerClient, LedgerError, ReleaseReceipt, Submitted, ALREADY_DEPLOYED, ESCROW_NOT_FOUND,
};

/// Operations that accept injected failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LedgerOp {
    Deploy,
    Approve,
    Contribute,
    SubmitEvidence,
    Release,
    Read,
}

#[derive(Debug, Clone)]
struct MockEscrow {
    owner: String,
    goal: i64,
    milestones: Vec<i64>,
    funded: i64,
    contributions: HashMap<String, i64>,
    shares: HashMap<String, i64>,
    evidence: HashSet<u32>,
    released: u32,
    released_amount: i64,
}

impl MockEscrow {
    fn snapshot(&self, campaign_id: u64) -> EscrowSnapshot {
        let milestones_total = self.milestones.len() as u32;
        EscrowSnapshot {
            campaign_id,
            owner: self.owner.clone(),
            goal: self.goal,
            funded: self.funded,
            investor_count: self.contributions.len() as u32,
            milestones_total,
            milestones_released: self.released,
            released_amount: self.released_amount,
            total_shares: self.shares.values().sum(),
            completed: self.released == milestones_total,
        }
    }
}

#[derive(Default)]
struct Book {
    escrows: HashMap<u64, MockEscrow>,
    allowances: HashMap<String, i64>,
    events: Vec<EventEnvelope>,
    transactions: HashMap<String, i64>,
    failures: HashMap<LedgerOp, VecDeque<LedgerError>>,
    sequence: i64,
}

impl Book {
    fn take_failure(&mut self, op: LedgerOp) -> Result<(), LedgerError> {
        match self.failures.get_mut(&op).and_then(VecDeque::pop_front) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn next_tx(&mut self) -> (String, i64) {
        self.sequence += 1;
        let hash = hex::encode(Sha256::digest(format!("mock-tx-{}", self.sequence)));
        self.transactions.insert(hash.clone(), self.sequence);
        (hash, self.sequence)
    }

    fn emit(&mut self, tx_hash: &str, ledger: i64, event: LedgerEvent) {
        self.events.push(EventEnvelope {
            tx_hash: tx_hash.to_string(),
            ledger,
            event,
        });
    }

    fn escrow_mut(&mut self, campaign_id: u64) -> Result<&mut MockEscrow, LedgerError> {
        self.escrows
            .get_mut(&campaign_id)
            .ok_or_else(|| LedgerError::from_code(ESCROW_NOT_FOUND))
    }
}

pub struct MockLedger {
    book: Mutex<Book>,
    fee_bps: u32,
    stall_confirmations: AtomicBool,
}

impl MockLedger {
    pub fn new(fee_bps: u32) -> Self {
        Self {
            book: Mutex::new(Book::default()),
            fee_bps,
            stall_confirmations: AtomicBool::new(false),
        }
    }

    #[cfg(test)]
    /// Make the next call of `op` fail with `err`. Queued failures are
    /// consumed in FIFO order.
    pub fn fail_next(&self, op: LedgerOp, err: LedgerError) {
        if let Ok(mut book) = self.book.lock() {
            book.failures.entry(op).or_default().push_back(err);
        }
    }

    #[cfg(test)]
    /// While set, `confirm` never resolves.
    pub fn stall_confirmations(&self, stall: bool) {
        self.stall_confirmations.store(stall, Ordering::SeqCst);
    }

    #[cfg(test)]
    pub fn escrow_count(&self) -> usize {
        self.book.lock().map(|b| b.escrows.len()).unwrap_or(0)
    }

    #[cfg(test)]
    /// Every event emitted so far, in ledger order.
    pub fn emitted(&self) -> Vec<EventEnvelope> {
        self.book
            .lock()
            .map(|b| b.events.clone())
            .unwrap_or_default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Book>, LedgerError> {
        self.book
            .lock()
            .map_err(|e| LedgerError::Network(format!("mutex poisoned: {e}")))
    }
}

impl Default for MockLedger {
    fn default() -> Self {
        Self::new(250)
    }
}

#[async_trait]
impl LedgerClient for MockLedger {
    async fn deploy(&self, req: &DeployRequest) -> Result<Submitted<EscrowSnapshot>, LedgerError> {
        let mut book = self.lock()?;
        book.take_failure(LedgerOp::Deploy)?;

        if book.escrows.contains_key(&req.campaign_id) {
            return Err(LedgerError::from_code(ALREADY_DEPLOYED));
        }
        escrow_rules::validate_schedule(
            req.goal as i128,
            req.milestones.iter().map(|m| *m as i128),
        )
        .map_err(LedgerError::reverted)?;

        let escrow = MockEscrow {
            owner: req.owner.clone(),
            goal: req.goal,
            milestones: req.milestones.clone(),
            funded: 0,
            contributions: HashMap::new(),
            shares: HashMap::new(),
            evidence: HashSet::new(),
            released: 0,
            released_amount: 0,
        };
        let snapshot = escrow.snapshot(req.campaign_id);
        book.escrows.insert(req.campaign_id, escrow);

        let (tx_hash, ledger) = book.next_tx();
        book.emit(
            &tx_hash,
            ledger,
            LedgerEvent::EscrowCreated {
                campaign_id: req.campaign_id,
                owner: req.owner.clone(),
                goal: req.goal,
                milestones_total: req.milestones.len() as u32,
            },
        );
        Ok(Submitted {
            tx_hash,
            value: snapshot,
        })
    }

    async fn approve_spend(&self, contributor: &str, amount: i64) -> Result<Submitted<()>, LedgerError> {
        let mut book = self.lock()?;
        book.take_failure(LedgerOp::Approve)?;
        book.allowances.insert(contributor.to_string(), amount);
        let (tx_hash, _) = book.next_tx();
        Ok(Submitted { tx_hash, value: () })
    }

    async fn contribute(&self, req: &ContributeRequest) -> Result<Submitted<i64>, LedgerError> {
        let mut book = self.lock()?;
        book.take_failure(LedgerOp::Contribute)?;

        let allowance = book.allowances.get(&req.contributor).copied().unwrap_or(0);
        if allowance < req.amount {
            return Err(LedgerError::Unauthorized(format!(
                "allowance {allowance} below contribution {}",
                req.amount
            )));
        }

        let escrow = book.escrow_mut(req.campaign_id)?;
        let funded = escrow_rules::accept_contribution(
            escrow.goal as i128,
            escrow.funded as i128,
            req.amount as i128,
            req.contributor == escrow.owner,
        )
        .map_err(LedgerError::reverted)? as i64;

        escrow.funded = funded;
        *escrow
            .contributions
            .entry(req.contributor.clone())
            .or_insert(0) += req.amount;
        *escrow.shares.entry(req.contributor.clone()).or_insert(0) +=
            escrow_rules::shares_for(req.amount as i128) as i64;

        book.allowances
            .insert(req.contributor.clone(), allowance - req.amount);
        let (tx_hash, ledger) = book.next_tx();
        book.emit(
            &tx_hash,
            ledger,
            LedgerEvent::ContributionReceived {
                campaign_id: req.campaign_id,
                contributor: req.contributor.clone(),
                amount: req.amount,
                funded,
            },
        );
        Ok(Submitted {
            tx_hash,
            value: funded,
        })
    }

    async fn submit_evidence(
        &self,
        campaign_id: u64,
        index: u32,
        _evidence_hash: [u8; 32],
    ) -> Result<Submitted<()>, LedgerError> {
        let mut book = self.lock()?;
        book.take_failure(LedgerOp::SubmitEvidence)?;

        let escrow = book.escrow_mut(campaign_id)?;
        if index as usize >= escrow.milestones.len() {
            return Err(LedgerError::reverted(escrow_rules::Violation::MilestoneNotFound));
        }
        if index < escrow.released {
            return Err(LedgerError::reverted(
                escrow_rules::Violation::MilestoneAlreadyReleased,
            ));
        }
        escrow.evidence.insert(index);

        let (tx_hash, ledger) = book.next_tx();
        book.emit(
            &tx_hash,
            ledger,
            LedgerEvent::EvidenceSubmitted { campaign_id, index },
        );
        Ok(Submitted { tx_hash, value: () })
    }

    async fn release_milestone(
        &self,
        campaign_id: u64,
        index: u32,
    ) -> Result<Submitted<ReleaseReceipt>, LedgerError> {
        let mut book = self.lock()?;
        book.take_failure(LedgerOp::Release)?;

        let fee_bps = self.fee_bps;
        let escrow = book.escrow_mut(campaign_id)?;
        escrow_rules::check_release(
            index,
            escrow.released,
            escrow.milestones.len() as u32,
            escrow.evidence.contains(&index),
        )
        .map_err(LedgerError::reverted)?;

        let amount = escrow.milestones[index as usize];
        if escrow.funded - escrow.released_amount < amount {
            return Err(LedgerError::reverted(
                escrow_rules::Violation::InsufficientEscrow,
            ));
        }
        let split =
            escrow_rules::split_fee(amount as i128, fee_bps).map_err(LedgerError::reverted)?;
        escrow.released += 1;
        escrow.released_amount += amount;

        let receipt = ReleaseReceipt {
            index,
            amount,
            fee: split.fee as i64,
            researcher_amount: split.researcher_amount as i64,
        };
        let (tx_hash, ledger) = book.next_tx();
        book.emit(
            &tx_hash,
            ledger,
            LedgerEvent::MilestoneReleased {
                campaign_id,
                index,
                amount,
                fee: receipt.fee,
                researcher_amount: receipt.researcher_amount,
            },
        );
        Ok(Submitted {
            tx_hash,
            value: receipt,
        })
    }

    async fn confirm(&self, tx_hash: &str) -> Result<Confirmation, LedgerError> {
        if self.stall_confirmations.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        let book = self.lock()?;
        match book.transactions.get(tx_hash) {
            Some(ledger) => Ok(Confirmation { ledger: *ledger }),
            None => Err(LedgerError::Decode(format!("unknown transaction {tx_hash}"))),
        }
    }

    async fn escrow(&self, campaign_id: u64) -> Result<Option<EscrowSnapshot>, LedgerError> {
        let mut book = self.lock()?;
        book.take_failure(LedgerOp::Read)?;
        Ok(book.escrows.get(&campaign_id).map(|e| e.snapshot(campaign_id)))
    }

    async fn events(&self, cursor: &EventCursor, limit: u32) -> Result<EventPage, LedgerError> {
        let book = self.lock()?;
        let start = match cursor.cursor.as_deref() {
            Some(c) => c
                .parse::<usize>()
                .map_err(|_| LedgerError::Decode(format!("bad cursor {c}")))?,
            None => book
                .events
                .iter()
                .position(|e| e.ledger >= cursor.start_ledger as i64)
                .unwrap_or(book.events.len()),
        };
        let end = (start + limit as usize).min(book.events.len());
        let events = book.events.get(start..end).map(<[_]>::to_vec).unwrap_or_default();

        Ok(EventPage {
            events,
            next_cursor: Some(end.to_string()),
            latest_ledger: Some(book.sequence as u64),
        })
    }
}
