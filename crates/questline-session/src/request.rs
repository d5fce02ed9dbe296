//! Reply correlation: one request, many targets, validated single-byte
//! answers.
//!
//! ```text
//!                 ┌─────────── send request ───────────┐
//!                 ▼                                    ▼
//!          listener(P-1)                        listener(P-2)       (one task each)
//!   recv ─▶ validate ─▶ accept? ─▶ echo to all   recv ─▶ ...
//!                 │                                    │
//!                 └──── RequestContext (atomics + mutex) ────┐
//!                                                            ▼
//!                                 driver: wait until handled == to_receive
//!                                         or the session stop flag is raised
//! ```
//!
//! The driver never touches session state. It reports which targets
//! errored and the [`Session`](crate::Session) applies the consequences
//! (crash notices, leader re-election).

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use questline_protocol::{PlayerId, ReplyValidity, SessionEvent, parse_reply};
use questline_transport::Connection;
use tokio::sync::{Notify, watch};
use tokio::task::JoinSet;

/// Accepted replies, by participant.
pub type Replies = BTreeMap<PlayerId, u8>;

/// Checks a reply value. `Err` names the specific invalidity.
pub type Validator = Arc<dyn Fn(u8) -> Result<(), ReplyValidity> + Send + Sync>;

/// How many replies a request accepts and how long it waits.
///
/// | `first_reply_only` | `wait_all_replies` | accepts | completes after |
/// |---|---|---|---|
/// | no  | -   | every target | every target handled |
/// | yes | no  | 1 | 1 target handled |
/// | yes | yes | 1 | every target handled |
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplyPolicy {
    pub first_reply_only: bool,
    pub wait_all_replies: bool,
}

impl ReplyPolicy {
    /// Every target must answer.
    pub const fn all() -> Self {
        Self {
            first_reply_only: false,
            wait_all_replies: false,
        }
    }

    /// The first valid answer decides, the request ends right away.
    pub const fn first() -> Self {
        Self {
            first_reply_only: true,
            wait_all_replies: false,
        }
    }

    /// The first valid answer decides, the others still get to reply
    /// (and are told they were too late).
    pub const fn first_then_wait() -> Self {
        Self {
            first_reply_only: true,
            wait_all_replies: true,
        }
    }

    /// Quorum: how many valid replies are accepted.
    pub fn to_accept(&self, targets: usize) -> usize {
        if self.first_reply_only { 1 } else { targets }
    }

    /// Completion threshold: how many targets must be handled.
    pub fn to_receive(&self, targets: usize) -> usize {
        match (self.first_reply_only, self.wait_all_replies) {
            (true, true) => targets,
            (true, false) => 1,
            (false, _) => self.to_accept(targets),
        }
    }
}

/// What a finished correlation hands back to the session.
#[derive(Debug, Default)]
pub(crate) struct Outcome {
    /// Accepted replies from targets that are still reachable.
    pub replies: Replies,
    /// Targets whose connection failed at any point.
    pub errored: Vec<PlayerId>,
    /// The stop flag ended the wait.
    pub cancelled: bool,
}

// ---------------------------------------------------------------------------
// RequestContext
// ---------------------------------------------------------------------------

/// State shared by the driver and every listener of one request.
struct RequestContext {
    to_accept: usize,
    handled: AtomicUsize,
    handled_flags: HashMap<PlayerId, AtomicBool>,
    replies: Mutex<Replies>,
    errors: Mutex<Vec<PlayerId>>,
    progress: Notify,
}

impl RequestContext {
    fn new(ids: impl Iterator<Item = PlayerId>, to_accept: usize) -> Self {
        Self {
            to_accept,
            handled: AtomicUsize::new(0),
            handled_flags: ids.map(|id| (id, AtomicBool::new(false))).collect(),
            replies: Mutex::new(Replies::new()),
            errors: Mutex::new(Vec::new()),
            progress: Notify::new(),
        }
    }

    fn handled(&self) -> usize {
        self.handled.load(Ordering::Acquire)
    }

    fn is_handled(&self, id: PlayerId) -> bool {
        self.handled_flags
            .get(&id)
            .is_some_and(|flag| flag.load(Ordering::Acquire))
    }

    /// Counts `id` as handled, once.
    fn mark_handled(&self, id: PlayerId) {
        let Some(flag) = self.handled_flags.get(&id) else {
            return;
        };
        if !flag.swap(true, Ordering::AcqRel) {
            self.handled.fetch_add(1, Ordering::AcqRel);
            self.progress.notify_one();
        }
    }

    /// Records a transport failure for `id`; it counts as handled.
    fn fail(&self, id: PlayerId) {
        {
            let mut errors = self.errors.lock().unwrap_or_else(PoisonError::into_inner);
            if !errors.contains(&id) {
                errors.push(id);
            }
        }
        self.mark_handled(id);
    }

    fn is_errored(&self, id: PlayerId) -> bool {
        self.errors
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&id)
    }

    /// Records the reply if the quorum still has room.
    fn try_accept(&self, id: PlayerId, value: u8) -> bool {
        let mut replies = self.replies.lock().unwrap_or_else(PoisonError::into_inner);
        if replies.len() >= self.to_accept {
            return false;
        }
        replies.insert(id, value);
        true
    }

    fn take(&self) -> (Replies, Vec<PlayerId>) {
        let errors = std::mem::take(
            &mut *self.errors.lock().unwrap_or_else(PoisonError::into_inner),
        );
        let mut replies = std::mem::take(
            &mut *self.replies.lock().unwrap_or_else(PoisonError::into_inner),
        );
        replies.retain(|id, _| !errors.contains(id));
        (replies, errors)
    }
}

type Targets = Arc<[(PlayerId, Arc<Connection>)]>;

/// Resolves once `flag` is raised. A dropped sender counts as raised.
async fn raised(flag: &mut watch::Receiver<bool>) {
    let _ = flag.wait_for(|raised| *raised).await;
}

fn encode(event: &SessionEvent) -> Option<Vec<u8>> {
    match event.encode() {
        Ok(frame) => Some(frame),
        Err(e) => {
            tracing::error!(error = %e, "failed to encode session event");
            None
        }
    }
}

// ---------------------------------------------------------------------------
// Driver
// ---------------------------------------------------------------------------

/// Sends `frame` to every target and collects replies under `policy`.
pub(crate) async fn correlate(
    targets: Vec<(PlayerId, Arc<Connection>)>,
    frame: Vec<u8>,
    validator: Validator,
    policy: ReplyPolicy,
    mut stop: watch::Receiver<bool>,
) -> Outcome {
    let total = targets.len();
    let ctx = Arc::new(RequestContext::new(
        targets.iter().map(|(id, _)| *id),
        policy.to_accept(total),
    ));
    let to_receive = policy.to_receive(total);

    let mut reachable = Vec::with_capacity(total);
    for (id, conn) in targets {
        match conn.send(&frame).await {
            Ok(()) => reachable.push((id, conn)),
            Err(e) => {
                tracing::warn!(player_id = %id, error = %e, "request send failed");
                ctx.fail(id);
            }
        }
    }
    let reachable: Targets = reachable.into();

    let (finished_tx, finished_rx) = watch::channel(false);
    let mut listeners = JoinSet::new();
    for (id, conn) in reachable.iter() {
        listeners.spawn(listen(
            *id,
            Arc::clone(conn),
            Arc::clone(&ctx),
            Arc::clone(&reachable),
            Arc::clone(&validator),
            finished_rx.clone(),
        ));
    }

    let cancelled = loop {
        if ctx.handled() >= to_receive {
            break false;
        }
        tokio::select! {
            biased;
            _ = ctx.progress.notified() => {}
            _ = raised(&mut stop) => break true,
        }
    };

    // Listeners only observe this at their receive point, so a reply echo
    // or validation already being written is never cut short.
    finished_tx.send_replace(true);
    while let Some(joined) = listeners.join_next().await {
        if let Err(e) = joined {
            tracing::error!(error = %e, "reply listener failed");
        }
    }

    if let Some(finish) = encode(&SessionEvent::FinishRequest) {
        for (id, conn) in reachable.iter() {
            if ctx.is_errored(*id) {
                continue;
            }
            if let Err(e) = conn.send(&finish).await {
                tracing::warn!(player_id = %id, error = %e, "finish notice failed");
                ctx.fail(*id);
            }
        }
    }

    let (replies, errored) = ctx.take();
    tracing::debug!(
        replies = replies.len(),
        errored = errored.len(),
        cancelled,
        "request resolved"
    );
    Outcome {
        replies,
        errored,
        cancelled,
    }
}

// ---------------------------------------------------------------------------
// Listener
// ---------------------------------------------------------------------------

/// Waits for one valid reply from `id`, re-listening after invalid ones.
async fn listen(
    id: PlayerId,
    conn: Arc<Connection>,
    ctx: Arc<RequestContext>,
    targets: Targets,
    validator: Validator,
    mut finished: watch::Receiver<bool>,
) {
    loop {
        let received = tokio::select! {
            biased;
            _ = raised(&mut finished) => return,
            received = conn.recv() => received,
        };

        // A failed echo from another listener may have given up on us.
        if ctx.is_handled(id) {
            return;
        }

        let bytes = match received {
            Ok(Some(bytes)) => bytes,
            Ok(None) => {
                tracing::info!(player_id = %id, "connection closed during request");
                ctx.fail(id);
                return;
            }
            Err(e) => {
                tracing::warn!(player_id = %id, error = %e, "reply receive failed");
                ctx.fail(id);
                return;
            }
        };

        let validity = match parse_reply(&bytes).and_then(|value| validator(value).map(|()| value)) {
            Ok(value) if ctx.try_accept(id, value) => {
                tracing::info!(player_id = %id, value, "reply accepted");
                echo(&ctx, &targets, id, value).await;
                ReplyValidity::Ok
            }
            Ok(_) => {
                tracing::info!(player_id = %id, "reply too late");
                ReplyValidity::TooLate
            }
            Err(validity) => {
                tracing::debug!(player_id = %id, %validity, "invalid reply");
                validity
            }
        };

        if let Some(frame) = encode(&SessionEvent::Validation(validity)) {
            if let Err(e) = conn.send(&frame).await {
                tracing::warn!(player_id = %id, error = %e, "validation send failed");
                ctx.fail(id);
                return;
            }
        }

        if !validity.is_invalid() {
            ctx.mark_handled(id);
            return;
        }
    }
}

/// Tells every reachable target that `id` answered `value`.
async fn echo(ctx: &RequestContext, targets: &Targets, id: PlayerId, value: u8) {
    let Some(frame) = encode(&SessionEvent::Reply { player: id, value }) else {
        return;
    };
    for (other, conn) in targets.iter() {
        if ctx.is_errored(*other) {
            continue;
        }
        if let Err(e) = conn.send(&frame).await {
            tracing::warn!(player_id = %other, error = %e, "reply echo failed");
            ctx.fail(*other);
        }
    }
}
