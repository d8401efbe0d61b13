//! RateGovernor - トークンバケットによる送信制御
//!
//! A single actor task owns the buckets; callers talk to it over a channel,
//! so there is no shared mutable state and no lock discipline to get wrong.
//!
//! - One global bucket caps all sends. Optionally every target (chat, user,
//!   address) also gets its own bucket, and a keyed request needs a token
//!   from both.
//! - Refill is computed lazily from elapsed time whenever the actor looks at
//!   a bucket. There is no refill timer; an idle governor does no work.
//! - Waiters are served in arrival order for the global bucket. A waiter held
//!   back only by its own target's bucket does not block other targets.
//! - The actor, not the caller, decides whether a deadline has passed, so a
//!   denied request never consumes tokens.
//! - Tokens are capped at `capacity`, which bounds the grants in any window
//!   of length T by `capacity + refill_per_sec * T`.
//! - A target bucket that has refilled completely is dropped; it is
//!   indistinguishable from a fresh one.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

const REQUEST_BUFFER: usize = 256;

// float slack when comparing token counts
const EPSILON: f64 = 1e-9;

/// Size and refill rate of one bucket.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BucketLimit {
    pub capacity: u32,
    pub refill_per_sec: f64,
}

impl BucketLimit {
    pub fn new(capacity: u32, refill_per_sec: f64) -> Self {
        Self {
            capacity,
            refill_per_sec,
        }
    }
}

enum Request {
    Acquire(Waiter),
    WaitTime {
        target: Option<String>,
        n: u32,
        reply: oneshot::Sender<Option<Duration>>,
    },
}

struct Waiter {
    n: u32,
    target: Option<String>,
    deadline: Instant,
    reply: oneshot::Sender<bool>,
}

/// Handle to the governor actor. Cheap to clone; the actor stops when the
/// last handle is dropped.
#[derive(Clone)]
pub struct RateGovernor {
    tx: mpsc::Sender<Request>,
    capacity: u32,
    per_target: Option<BucketLimit>,
}

impl RateGovernor {
    /// Start the actor on the current tokio runtime with a full bucket and
    /// no per-target limit.
    pub fn spawn(capacity: u32, refill_per_sec: f64) -> Self {
        Self::spawn_with(BucketLimit::new(capacity, refill_per_sec), None)
    }

    /// Start the actor with a global bucket and, optionally, a bucket per
    /// target.
    pub fn spawn_with(global: BucketLimit, per_target: Option<BucketLimit>) -> Self {
        let (tx, rx) = mpsc::channel(REQUEST_BUFFER);
        let actor = Actor::new(global, per_target, Instant::now());
        tokio::spawn(run(rx, actor));
        Self {
            tx,
            capacity: global.capacity,
            per_target,
        }
    }

    /// Wait up to `timeout` for `n` global tokens. `false` means nothing was
    /// taken.
    pub async fn acquire(&self, n: u32, timeout: Duration) -> bool {
        self.request(None, n, timeout).await
    }

    /// Like `acquire`, but the tokens also come out of `target`'s bucket.
    pub async fn acquire_for(&self, target: &str, n: u32, timeout: Duration) -> bool {
        self.request(Some(target), n, timeout).await
    }

    /// Take `n` tokens only if they are available right now.
    pub async fn try_acquire(&self, n: u32) -> bool {
        self.acquire(n, Duration::ZERO).await
    }

    /// Estimated wait until `n` tokens (for `target`, if given) would be
    /// granted, counting requests already queued. `None` means never: the
    /// bucket is short and does not refill, or the governor has stopped.
    pub async fn wait_time(&self, target: Option<&str>, n: u32) -> Option<Duration> {
        let (reply, estimate) = oneshot::channel();
        let request = Request::WaitTime {
            target: target.map(str::to_owned),
            n,
            reply,
        };
        self.tx.send(request).await.ok()?;
        estimate.await.ok().flatten()
    }

    async fn request(&self, target: Option<&str>, n: u32, timeout: Duration) -> bool {
        if n == 0 {
            return true;
        }
        let limit = match (target, self.per_target) {
            (Some(_), Some(per_target)) => self.capacity.min(per_target.capacity),
            _ => self.capacity,
        };
        if n > limit {
            tracing::debug!(n, limit, "request larger than bucket");
            return false;
        }

        let deadline = Instant::now() + timeout;
        let (reply, granted) = oneshot::channel();
        let request = Request::Acquire(Waiter {
            n,
            target: target.map(str::to_owned),
            deadline,
            reply,
        });
        // a full request queue counts against the caller's deadline too
        match tokio::time::timeout_at(deadline, self.tx.send(request)).await {
            Ok(Ok(())) => granted.await.unwrap_or(false),
            Ok(Err(_)) | Err(_) => false,
        }
    }
}

#[derive(Debug)]
struct Bucket {
    capacity: f64,
    tokens: f64,
    refill_per_sec: f64,
    last_refill: Instant,
}

impl Bucket {
    fn full(limit: BucketLimit, now: Instant) -> Self {
        let capacity = f64::from(limit.capacity);
        Self {
            capacity,
            tokens: capacity,
            refill_per_sec: limit.refill_per_sec.max(0.0),
            last_refill: now,
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        self.last_refill = now;
    }

    fn has(&self, n: u32) -> bool {
        self.tokens + EPSILON >= f64::from(n)
    }

    fn take(&mut self, n: u32) {
        self.tokens = (self.tokens - f64::from(n)).max(0.0);
    }

    fn give_back(&mut self, n: u32) {
        self.tokens = (self.tokens + f64::from(n)).min(self.capacity);
    }

    fn is_full(&self) -> bool {
        self.tokens + EPSILON >= self.capacity
    }

    /// When `n` tokens will be available, or `None` if never (no refill).
    fn ready_at(&self, n: u32, now: Instant) -> Option<Instant> {
        let missing = f64::from(n) - self.tokens;
        if missing <= EPSILON {
            return Some(now);
        }
        if self.refill_per_sec <= 0.0 {
            return None;
        }
        Duration::try_from_secs_f64(missing / self.refill_per_sec)
            .ok()
            .map(|wait| now + wait)
    }
}

enum Grant {
    Granted,
    TargetShort,
    GlobalShort,
}

struct Actor {
    global: Bucket,
    per_target: Option<BucketLimit>,
    targets: HashMap<String, Bucket>,
    waiters: VecDeque<Waiter>,
}

impl Actor {
    fn new(global: BucketLimit, per_target: Option<BucketLimit>, now: Instant) -> Self {
        Self {
            global: Bucket::full(global, now),
            per_target,
            targets: HashMap::new(),
            waiters: VecDeque::new(),
        }
    }

    fn refill(&mut self, now: Instant) {
        self.global.refill(now);
        for bucket in self.targets.values_mut() {
            bucket.refill(now);
        }
    }

    /// The bucket `target` draws from, created full on first use.
    fn target_bucket(&mut self, target: Option<&str>, now: Instant) -> Option<&mut Bucket> {
        let limit = self.per_target?;
        let target = target?;
        Some(
            self.targets
                .entry(target.to_owned())
                .or_insert_with(|| Bucket::full(limit, now)),
        )
    }

    fn try_grant(&mut self, n: u32, target: Option<&str>, now: Instant) -> Grant {
        if let Some(bucket) = self.target_bucket(target, now)
            && !bucket.has(n)
        {
            return Grant::TargetShort;
        }
        if !self.global.has(n) {
            return Grant::GlobalShort;
        }
        self.global.take(n);
        if let Some(bucket) = self.target_bucket(target, now) {
            bucket.take(n);
        }
        Grant::Granted
    }

    fn refund(&mut self, n: u32, target: Option<&str>, now: Instant) {
        self.global.give_back(n);
        if let Some(bucket) = self.target_bucket(target, now) {
            bucket.give_back(n);
        }
    }

    /// Grant every waiter that can be served, in arrival order, and deny
    /// every waiter whose deadline has passed. Once a live waiter is short
    /// on global tokens, nobody behind it gets global tokens either.
    fn settle(&mut self, now: Instant) {
        self.refill(now);

        let mut global_blocked = false;
        let mut kept = VecDeque::with_capacity(self.waiters.len());
        while let Some(waiter) = self.waiters.pop_front() {
            if waiter.reply.is_closed() {
                continue;
            }
            let grant = if global_blocked {
                Grant::GlobalShort
            } else {
                self.try_grant(waiter.n, waiter.target.as_deref(), now)
            };
            match grant {
                Grant::Granted => {
                    let Waiter { n, target, reply, .. } = waiter;
                    if reply.send(true).is_err() {
                        // caller gave up between the check and the send
                        self.refund(n, target.as_deref(), now);
                    }
                }
                _ if waiter.deadline <= now => {
                    let _ = waiter.reply.send(false);
                }
                Grant::GlobalShort => {
                    global_blocked = true;
                    kept.push_back(waiter);
                }
                Grant::TargetShort => kept.push_back(waiter),
            }
        }
        self.waiters = kept;
        self.evict_idle();
    }

    fn evict_idle(&mut self) {
        let waiters = &self.waiters;
        self.targets.retain(|target, bucket| {
            !bucket.is_full() || waiters.iter().any(|w| w.target.as_deref() == Some(target))
        });
    }

    /// When `waiter` could be granted if nobody were ahead of it.
    fn ready_at(&self, waiter: &Waiter, now: Instant) -> Option<Instant> {
        let global = self.global.ready_at(waiter.n, now)?;
        let target = match waiter.target.as_ref().and_then(|t| self.targets.get(t)) {
            Some(bucket) => bucket.ready_at(waiter.n, now)?,
            None => now,
        };
        Some(global.max(target))
    }

    /// Earliest instant something can change: a waiter becoming grantable or
    /// timing out. Instants not after `now` were already handled by `settle`.
    fn next_wake(&self, now: Instant) -> Option<Instant> {
        self.waiters
            .iter()
            .filter_map(|w| self.ready_at(w, now))
            .filter(|at| *at > now)
            .chain(self.waiters.iter().map(|w| w.deadline))
            .min()
    }

    fn wait_time(&mut self, target: Option<&str>, n: u32, now: Instant) -> Option<Duration> {
        self.refill(now);

        let queued_global: u32 = self.waiters.iter().map(|w| w.n).sum();
        let mut ready = self.global.ready_at(queued_global.saturating_add(n), now)?;

        if let (Some(target), Some(_)) = (target, self.per_target)
            && let Some(bucket) = self.targets.get(target)
        {
            let queued: u32 = self
                .waiters
                .iter()
                .filter(|w| w.target.as_deref() == Some(target))
                .map(|w| w.n)
                .sum();
            ready = ready.max(bucket.ready_at(queued.saturating_add(n), now)?);
        }
        Some(ready.saturating_duration_since(now))
    }
}

async fn run(mut rx: mpsc::Receiver<Request>, mut actor: Actor) {
    loop {
        let now = Instant::now();
        actor.settle(now);
        let wake = actor.next_wake(now);

        tokio::select! {
            request = rx.recv() => match request {
                Some(Request::Acquire(waiter)) => actor.waiters.push_back(waiter),
                Some(Request::WaitTime { target, n, reply }) => {
                    let _ = reply.send(actor.wait_time(target.as_deref(), n, Instant::now()));
                }
                None => break,
            },
            _ = sleep_until(wake) => {}
        }
    }
    tracing::debug!("rate governor stopped");
}

async fn sleep_until(wake: Option<Instant>) {
    match wake {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}
