//! Two-phase credit reservations (spec.md §4.6).
//!
//! The manager owns the reservation map and a shadow "held balance"
//! mirror, kept under one lock as the spec requires. `settle` calls back
//! into `KeyStore` only after releasing its own lock, per the fixed lock
//! order in spec.md §5 (ReservationManager → KeyStore, never the reverse).

use crate::core::keystore::KeyStore;
use crate::error::DenyReason;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rand::RngCore;
use serde::Serialize;
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReservationStatus {
    Held,
    Settled,
    Released,
    Expired,
}

#[derive(Debug, Clone, Serialize)]
pub struct Reservation {
    pub id: String,
    pub key: String,
    pub credits: i64,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub memo: Option<String>,
    pub status: ReservationStatus,
    pub settled_amount: Option<i64>,
    pub settled_at: Option<DateTime<Utc>>,
    pub released_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ReservationStats {
    pub held_count: u64,
    pub held_credits: i64,
    pub settled_count: u64,
    pub settled_credits: i64,
    pub released_count: u64,
    pub released_credits: i64,
    pub expired_count: u64,
    pub expired_credits: i64,
}

pub enum ReserveError {
    InvalidAmount,
    Insufficient { available: i64 },
}

pub enum SettleError {
    NotFound,
    NotHeld,
}

pub struct CreditReservationManager {
    reservations: Mutex<HashMap<String, Reservation>>,
    default_ttl_secs: i64,
}

impl CreditReservationManager {
    pub fn new(default_ttl_secs: i64) -> Self {
        Self { reservations: Mutex::new(HashMap::new()), default_ttl_secs }
    }

    fn generate_id() -> String {
        let mut bytes = [0u8; 12];
        rand::thread_rng().fill_bytes(&mut bytes);
        format!("rsv_{}", hex::encode(bytes))
    }

    /// Sum of `credits` across held reservations for `key`.
    pub fn held_balance(&self, key: &str) -> i64 {
        self.reservations
            .lock()
            .values()
            .filter(|r| r.key == key && r.status == ReservationStatus::Held)
            .map(|r| r.credits)
            .sum()
    }

    pub fn reserve(
        &self,
        store: &KeyStore,
        key: &str,
        amount: i64,
        ttl_seconds: Option<i64>,
        memo: Option<String>,
    ) -> Result<Reservation, ReserveError> {
        if amount <= 0 {
            return Err(ReserveError::InvalidAmount);
        }
        let balance = store.peek_key(key).map(|r| r.credits).unwrap_or(0);

        let mut reservations = self.reservations.lock();
        let held: i64 = reservations
            .values()
            .filter(|r| r.key == key && r.status == ReservationStatus::Held)
            .map(|r| r.credits)
            .sum();
        let available = balance - held;
        if amount > available {
            return Err(ReserveError::Insufficient { available });
        }

        let now = Utc::now();
        let ttl = ttl_seconds.unwrap_or(self.default_ttl_secs);
        let reservation = Reservation {
            id: Self::generate_id(),
            key: key.to_string(),
            credits: amount,
            created_at: now,
            expires_at: now + chrono::Duration::seconds(ttl),
            memo,
            status: ReservationStatus::Held,
            settled_amount: None,
            settled_at: None,
            released_at: None,
        };
        reservations.insert(reservation.id.clone(), reservation.clone());
        Ok(reservation)
    }

    /// Deducts `min(actual_amount ?? reserved, reserved)` from the real
    /// balance and marks the reservation settled.
    pub fn settle(
        &self,
        store: &KeyStore,
        id: &str,
        actual_amount: Option<i64>,
    ) -> Result<Reservation, SettleError> {
        let (key, charge) = {
            let mut reservations = self.reservations.lock();
            let reservation = reservations.get_mut(id).ok_or(SettleError::NotFound)?;
            if reservation.status != ReservationStatus::Held {
                return Err(SettleError::NotHeld);
            }
            let charge = actual_amount.unwrap_or(reservation.credits).min(reservation.credits).max(0);
            reservation.status = ReservationStatus::Settled;
            reservation.settled_amount = Some(charge);
            reservation.settled_at = Some(Utc::now());
            (reservation.key.clone(), charge)
        };

        if charge > 0 {
            let _ = store.deduct_credits(&key, charge);
        }

        Ok(self.reservations.lock().get(id).cloned().unwrap())
    }

    pub fn release(&self, id: &str) -> Result<Reservation, SettleError> {
        let mut reservations = self.reservations.lock();
        let reservation = reservations.get_mut(id).ok_or(SettleError::NotFound)?;
        if reservation.status != ReservationStatus::Held {
            return Err(SettleError::NotHeld);
        }
        reservation.status = ReservationStatus::Released;
        reservation.released_at = Some(Utc::now());
        Ok(reservation.clone())
    }

    /// Marks expired holds, freeing them without charging. Intended to run
    /// on a 1s sweep (spec.md §5).
    pub fn sweep_expired(&self) -> usize {
        let now = Utc::now();
        let mut reservations = self.reservations.lock();
        let mut count = 0;
        for reservation in reservations.values_mut() {
            if reservation.status == ReservationStatus::Held && reservation.expires_at < now {
                reservation.status = ReservationStatus::Expired;
                count += 1;
            }
        }
        count
    }

    pub fn get(&self, id: &str) -> Option<Reservation> {
        self.reservations.lock().get(id).cloned()
    }

    pub fn stats(&self) -> ReservationStats {
        let mut stats = ReservationStats::default();
        for r in self.reservations.lock().values() {
            match r.status {
                ReservationStatus::Held => {
                    stats.held_count += 1;
                    stats.held_credits += r.credits;
                }
                ReservationStatus::Settled => {
                    stats.settled_count += 1;
                    stats.settled_credits += r.settled_amount.unwrap_or(0);
                }
                ReservationStatus::Released => {
                    stats.released_count += 1;
                    stats.released_credits += r.credits;
                }
                ReservationStatus::Expired => {
                    stats.expired_count += 1;
                    stats.expired_credits += r.credits;
                }
            }
        }
        stats
    }
}

impl From<ReserveError> for DenyReason {
    fn from(err: ReserveError) -> Self {
        match err {
            ReserveError::InvalidAmount => DenyReason::Internal("invalid reservation amount".into()),
            ReserveError::Insufficient { available } => {
                DenyReason::InsufficientCredits { need: 0, have: available }
            }
        }
    }
}

impl From<SettleError> for DenyReason {
    fn from(err: SettleError) -> Self {
        match err {
            SettleError::NotFound => DenyReason::ReservationNotFound,
            SettleError::NotHeld => DenyReason::ReservationNotHeld,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::key_record::KeyOptions;

    fn store_with_balance(credits: i64) -> (KeyStore, String) {
        let store = KeyStore::in_memory();
        let (key, _) = store.create_key("test", credits, KeyOptions::default());
        (store, key)
    }

    #[test]
    fn reserve_then_settle_deducts_actual_amount() {
        let (store, key) = store_with_balance(1000);
        let mgr = CreditReservationManager::new(60);

        let reservation = mgr.reserve(&store, &key, 300, None, None).ok().unwrap();
        assert_eq!(store.peek_key(&key).unwrap().credits, 1000);
        assert_eq!(mgr.held_balance(&key), 300);

        let settled = mgr.settle(&store, &reservation.id, Some(250)).ok().unwrap();
        assert_eq!(settled.status, ReservationStatus::Settled);
        assert_eq!(store.peek_key(&key).unwrap().credits, 750);
        assert_eq!(mgr.held_balance(&key), 0);
    }

    #[test]
    fn reserve_denies_over_available_balance() {
        let (store, key) = store_with_balance(100);
        let mgr = CreditReservationManager::new(60);
        mgr.reserve(&store, &key, 80, None, None).ok().unwrap();
        assert!(matches!(
            mgr.reserve(&store, &key, 30, None, None),
            Err(ReserveError::Insufficient { available: 20 })
        ));
    }

    #[test]
    fn release_frees_hold_without_charging() {
        let (store, key) = store_with_balance(500);
        let mgr = CreditReservationManager::new(60);
        let reservation = mgr.reserve(&store, &key, 200, None, None).ok().unwrap();
        mgr.release(&reservation.id).ok().unwrap();
        assert_eq!(mgr.held_balance(&key), 0);
        assert_eq!(store.peek_key(&key).unwrap().credits, 500);
    }

    #[test]
    fn sweep_expires_past_ttl() {
        let (store, key) = store_with_balance(500);
        let mgr = CreditReservationManager::new(-1); // already expired
        let reservation = mgr.reserve(&store, &key, 100, Some(-1), None).ok().unwrap();
        let expired_count = mgr.sweep_expired();
        assert_eq!(expired_count, 1);
        assert_eq!(mgr.get(&reservation.id).unwrap().status, ReservationStatus::Expired);
    }
}
