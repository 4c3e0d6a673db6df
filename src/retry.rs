//! Retry an operation across a schedule of delays.
//!
//! Every outward call the engine makes is wrapped here so that transient
//! remote failures degrade into slower progress instead of dead repositories.
//! A schedule is a plain iterator of delays, which makes "three quick
//! attempts" and "retry forever, backing off" the same shape.

use std::time::Duration;

/// Run `op`, retrying on failure after each delay produced by `schedule`.
///
/// `on_attempt_failed` is invoked after every failed attempt with the error
/// and the delay before the next attempt, or `None` when the schedule is
/// exhausted and no further attempt will be made. The final failure is
/// surfaced to the caller.
///
/// An operation run against a schedule of N delays is attempted N+1 times.
pub fn retry<T, E, S, N, F>(schedule: S, mut on_attempt_failed: N, mut op: F) -> Result<T, E>
where
    S: IntoIterator<Item = Duration>,
    N: FnMut(&E, Option<Duration>),
    F: FnMut() -> Result<T, E>,
{
    let mut delays = schedule.into_iter();
    loop {
        match op() {
            Ok(value) => return Ok(value),
            Err(err) => match delays.next() {
                Some(delay) => {
                    on_attempt_failed(&err, Some(delay));
                    sleep(delay);
                }
                None => {
                    on_attempt_failed(&err, None);
                    return Err(err);
                }
            },
        }
    }
}

/// Three quick attempts; suits interactive one-shot commands.
pub fn short_schedule() -> impl Iterator<Item = Duration> {
    std::iter::repeat(Duration::from_secs(3)).take(3)
}

/// Back off to a steady rate and keep trying forever.
///
/// The tail settles at 9-minute intervals, which averages under 7 failures
/// per hour against a remote that is down: enough to page on, rare enough
/// not to hammer a degraded service.
pub fn endless_schedule() -> impl Iterator<Item = Duration> {
    let ramp = [3u64, 15, 60, 60, 180, 180];
    ramp.into_iter()
        .map(Duration::from_secs)
        .chain(std::iter::repeat(Duration::from_secs(540)))
}

fn sleep(delay: Duration) {
    if !delay.is_zero() {
        std::thread::sleep(delay);
    }
}
