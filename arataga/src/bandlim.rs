//! Turn-based bandwidth limiting.
//!
//! Quotas are granted per *turn* — the one-second quantum driven by the
//! global ticker. Within a turn a connection reserves a read portion,
//! performs the I/O, then releases the reservation reporting how much was
//! actually transferred. When the turn advances, `reserved` and `actual`
//! are cleared, the sequence number is bumped and the effective quota is
//! re-applied; a release carrying a stale sequence number leaves `reserved`
//! alone because that turn's reservation is already gone.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::config::{BandLimits, UNLIMITED};
use crate::user_list::{DomainName, UserId};

/// Transfer direction as seen by the limiter: where the bytes were read
/// from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    FromUser,
    FromTarget,
}

/// Counters of one direction of one channel-limits record.
#[derive(Debug, Default, Clone, Copy)]
struct DirectionTraffic {
    quota: u64,
    reserved: u64,
    actual: u64,
    seq: u64,
}

impl DirectionTraffic {
    fn free_space(&self) -> u64 {
        let spent = self.reserved.saturating_add(self.actual);
        self.quota.saturating_sub(spent)
    }

    fn start_new_turn(&mut self, quota: u64) {
        self.quota = quota;
        self.reserved = 0;
        self.actual = 0;
        self.seq += 1;
    }
}

/// Both directions of a user-level or domain-level record.
#[derive(Debug, Default, Clone, Copy)]
struct ChannelLimits {
    user_end: DirectionTraffic,
    target_end: DirectionTraffic,
}

impl ChannelLimits {
    fn new(limits: EffectiveLimits) -> Self {
        let mut this = Self::default();
        this.user_end.quota = limits.from_user;
        this.target_end.quota = limits.from_target;
        this
    }

    fn direction_mut(&mut self, dir: Direction) -> &mut DirectionTraffic {
        match dir {
            Direction::FromUser => &mut self.user_end,
            Direction::FromTarget => &mut self.target_end,
        }
    }

    fn start_new_turn(&mut self, limits: EffectiveLimits) {
        self.user_end.start_new_turn(limits.from_user);
        self.target_end.start_new_turn(limits.from_target);
    }
}

/// Quotas actually applied for a turn, already resolved against defaults.
#[derive(Debug, Clone, Copy)]
struct EffectiveLimits {
    from_user: u64,
    from_target: u64,
}

/// The personal limit applies when set; the process-wide default otherwise.
fn effective_limits(personal: &BandLimits, default: &BandLimits) -> EffectiveLimits {
    let pick = |own: u64, def: u64| if own != UNLIMITED { own } else { def };
    EffectiveLimits {
        // Bytes read from the user travel toward the target.
        from_user: pick(personal.to_target, default.to_target),
        from_target: pick(personal.to_user, default.to_user),
    }
}

#[derive(Debug)]
struct DomainEntry {
    connections: usize,
    limits: BandLimits,
    traffic: ChannelLimits,
}

#[derive(Debug)]
struct UserEntry {
    connection_count: usize,
    personal: BandLimits,
    general: ChannelLimits,
    domains: HashMap<DomainName, DomainEntry>,
}

/// Per-I/O-context registry of authenticated users and their counters.
///
/// Shared by every live traffic limiter of the context; the lifetime of a
/// user entry equals its longest holder.
pub struct UserRegistry {
    users: Mutex<HashMap<UserId, UserEntry>>,
    defaults: Mutex<BandLimits>,
    turn_started: Notify,
}

impl UserRegistry {
    pub fn new(defaults: BandLimits) -> Arc<Self> {
        Arc::new(Self {
            users: Mutex::new(HashMap::new()),
            defaults: Mutex::new(defaults),
            turn_started: Notify::new(),
        })
    }

    /// Registers one more connection of `user_id` and returns its traffic
    /// limiter.
    ///
    /// The personal limits may have changed since the previous login, so
    /// they are refreshed on every registration.
    pub fn register_connection(
        self: &Arc<Self>,
        user_id: UserId,
        personal: BandLimits,
        domain_limits: Option<(DomainName, BandLimits)>,
    ) -> TrafficLimiter {
        let defaults = *self.defaults.lock();
        let mut users = self.users.lock();

        let entry = users.entry(user_id).or_insert_with(|| UserEntry {
            connection_count: 0,
            personal,
            general: ChannelLimits::new(effective_limits(&personal, &defaults)),
            domains: HashMap::new(),
        });
        entry.connection_count += 1;
        entry.personal = personal;

        let domain = domain_limits.map(|(domain, limits)| {
            let domain_entry =
                entry.domains.entry(domain.clone()).or_insert_with(|| DomainEntry {
                    connections: 0,
                    limits,
                    traffic: ChannelLimits::new(effective_limits(&limits, &defaults)),
                });
            domain_entry.connections += 1;
            domain_entry.limits = limits;
            domain
        });

        TrafficLimiter { registry: Arc::clone(self), user_id, domain }
    }

    /// Applies new process-wide default limits on a config update. The new
    /// quotas take effect at the next turn.
    pub fn update_defaults(&self, defaults: BandLimits) {
        *self.defaults.lock() = defaults;
    }

    /// Starts a new turn: clears counters, bumps sequence numbers,
    /// re-applies effective quotas and wakes connections that backed off.
    pub fn advance_turn(&self) {
        let defaults = *self.defaults.lock();
        let mut users = self.users.lock();

        for entry in users.values_mut() {
            entry
                .general
                .start_new_turn(effective_limits(&entry.personal, &defaults));
            for domain_entry in entry.domains.values_mut() {
                domain_entry
                    .traffic
                    .start_new_turn(effective_limits(&domain_entry.limits, &defaults));
            }
        }
        drop(users);

        self.turn_started.notify_waiters();
    }

    /// Number of users currently holding at least one connection.
    pub fn user_count(&self) -> usize {
        self.users.lock().len()
    }
}

/// An acknowledged read budget for one I/O operation.
///
/// Must be released once the operation completes, successfully or not:
/// otherwise the reserved capacity stays occupied until the end of the
/// turn.
#[derive(Debug, Clone, Copy)]
pub struct ReservedCapacity {
    pub capacity: usize,
    seq: u64,
}

/// The per-connection handle that charges traffic against a user (and
/// optionally a per-domain) counter.
///
/// Dropping the handle decrements the user's connection count and the
/// domain entry's count, erasing entries that reach zero.
pub struct TrafficLimiter {
    registry: Arc<UserRegistry>,
    user_id: UserId,
    domain: Option<DomainName>,
}

impl TrafficLimiter {
    /// Reserves up to `requested` bytes for one read in direction `dir`.
    ///
    /// A zero capacity means the quota of this turn is exhausted; back off
    /// until the next turn.
    pub fn reserve_read_portion(&self, dir: Direction, requested: usize) -> ReservedCapacity {
        let mut users = self.registry.users.lock();
        let entry = users
            .get_mut(&self.user_id)
            .expect("user entry outlives its limiters");

        let general = entry.general.direction_mut(dir);
        let mut free = general.free_space();
        let seq = general.seq;

        if let Some(domain) = &self.domain {
            if let Some(domain_entry) = entry.domains.get_mut(domain) {
                free = free.min(domain_entry.traffic.direction_mut(dir).free_space());
            }
        }

        let capacity = (requested as u64).min(free);

        entry.general.direction_mut(dir).reserved += capacity;
        if let Some(domain) = &self.domain {
            if let Some(domain_entry) = entry.domains.get_mut(domain) {
                domain_entry.traffic.direction_mut(dir).reserved += capacity;
            }
        }

        ReservedCapacity { capacity: capacity as usize, seq }
    }

    /// Releases a reservation, accounting `actual_bytes` as transferred.
    /// On an I/O error pass 0.
    pub fn release_reserved_capacity(
        &self,
        dir: Direction,
        reservation: ReservedCapacity,
        actual_bytes: usize,
    ) {
        let mut users = self.registry.users.lock();
        let entry = users
            .get_mut(&self.user_id)
            .expect("user entry outlives its limiters");

        let release_one = |traffic: &mut DirectionTraffic| {
            traffic.actual += actual_bytes as u64;
            // A stale sequence number means the turn already rolled over
            // and cleared the reservation.
            if reservation.seq == traffic.seq && traffic.reserved >= reservation.capacity as u64 {
                traffic.reserved -= reservation.capacity as u64;
            }
        };

        release_one(entry.general.direction_mut(dir));
        if let Some(domain) = &self.domain {
            if let Some(domain_entry) = entry.domains.get_mut(domain) {
                release_one(domain_entry.traffic.direction_mut(dir));
            }
        }
    }

    /// Reserves capacity, waiting for the next turn as long as the current
    /// one is exhausted.
    pub async fn reserve(&self, dir: Direction, requested: usize) -> ReservedCapacity {
        loop {
            let turn = self.registry.turn_started.notified();
            let reservation = self.reserve_read_portion(dir, requested);
            if reservation.capacity > 0 {
                return reservation;
            }
            turn.await;
        }
    }
}

impl Drop for TrafficLimiter {
    fn drop(&mut self) {
        let mut users = self.registry.users.lock();
        let Some(entry) = users.get_mut(&self.user_id) else {
            return;
        };

        if let Some(domain) = &self.domain {
            if let Some(domain_entry) = entry.domains.get_mut(domain) {
                domain_entry.connections -= 1;
                if domain_entry.connections == 0 {
                    entry.domains.remove(domain);
                }
            }
        }

        entry.connection_count -= 1;
        if entry.connection_count == 0 {
            users.remove(&self.user_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limited(to_user: u64, to_target: u64) -> BandLimits {
        BandLimits { to_user, to_target }
    }

    #[test]
    fn reservation_is_bounded_by_quota() {
        let registry = UserRegistry::new(BandLimits::default());
        let limiter = registry.register_connection(1, limited(100, 1000), None);

        let r = limiter.reserve_read_portion(Direction::FromTarget, 70);
        assert_eq!(r.capacity, 70);
        let r2 = limiter.reserve_read_portion(Direction::FromTarget, 70);
        assert_eq!(r2.capacity, 30);
        let r3 = limiter.reserve_read_portion(Direction::FromTarget, 70);
        assert_eq!(r3.capacity, 0);

        // the other direction has its own budget
        let r4 = limiter.reserve_read_portion(Direction::FromUser, 500);
        assert_eq!(r4.capacity, 500);
    }

    #[test]
    fn release_returns_unused_reservation() {
        let registry = UserRegistry::new(BandLimits::default());
        let limiter = registry.register_connection(1, limited(100, UNLIMITED), None);

        let r = limiter.reserve_read_portion(Direction::FromTarget, 100);
        assert_eq!(r.capacity, 100);
        // only 40 bytes actually arrived
        limiter.release_reserved_capacity(Direction::FromTarget, r, 40);

        // 100 - actual(40) = 60 still free this turn
        let r2 = limiter.reserve_read_portion(Direction::FromTarget, 100);
        assert_eq!(r2.capacity, 60);
    }

    #[test]
    fn stale_release_does_not_touch_new_turn() {
        let registry = UserRegistry::new(BandLimits::default());
        let limiter = registry.register_connection(1, limited(100, UNLIMITED), None);

        let r = limiter.reserve_read_portion(Direction::FromTarget, 100);
        registry.advance_turn();

        // the release comes from the previous turn
        limiter.release_reserved_capacity(Direction::FromTarget, r, 100);

        // reserved must not underflow; the actual bytes count against the
        // new turn
        let r2 = limiter.reserve_read_portion(Direction::FromTarget, 100);
        assert_eq!(r2.capacity, 0);
        registry.advance_turn();
        let r3 = limiter.reserve_read_portion(Direction::FromTarget, 100);
        assert_eq!(r3.capacity, 100);
    }

    #[test]
    fn domain_limit_is_the_tighter_bound() {
        let registry = UserRegistry::new(BandLimits::default());
        let limiter = registry.register_connection(
            1,
            limited(1000, 1000),
            Some((DomainName::new("api.vk.com"), limited(64, UNLIMITED))),
        );

        let r = limiter.reserve_read_portion(Direction::FromTarget, 500);
        assert_eq!(r.capacity, 64);
    }

    #[test]
    fn unlimited_direction_never_blocks() {
        let registry = UserRegistry::new(BandLimits::default());
        let limiter = registry.register_connection(1, BandLimits::default(), None);

        let r = limiter.reserve_read_portion(Direction::FromUser, 1 << 20);
        assert_eq!(r.capacity, 1 << 20);
    }

    #[test]
    fn default_limits_apply_when_personal_not_set() {
        let registry = UserRegistry::new(limited(128, UNLIMITED));
        let limiter = registry.register_connection(1, BandLimits::default(), None);

        let r = limiter.reserve_read_portion(Direction::FromTarget, 1000);
        assert_eq!(r.capacity, 128);
    }

    #[test]
    fn entries_are_erased_when_last_holder_drops() {
        let registry = UserRegistry::new(BandLimits::default());
        let a = registry.register_connection(7, BandLimits::default(), None);
        let b = registry.register_connection(7, BandLimits::default(), None);
        assert_eq!(registry.user_count(), 1);

        drop(a);
        assert_eq!(registry.user_count(), 1);
        drop(b);
        assert_eq!(registry.user_count(), 0);
    }
}
