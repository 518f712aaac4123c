use std::{future::Future, pin::pin, time::Duration};

use async_io::Timer;
use futures::FutureExt;

/// Runs `fut` for at most `duration`. Returns `None` on timeout.
///
/// `fut` is polled before the timer so that an already settled future wins over a zero timeout.
pub async fn timeout<F: Future>(duration: Duration, fut: F) -> Option<F::Output> {
    let mut fut = pin!(fut.fuse());
    let mut timer = Timer::after(duration).fuse();
    futures::select_biased! {
        res = fut => Some(res),
        _ = timer => None,
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use futures::{executor::block_on, future};

    use super::*;

    #[test]
    fn test_timeout() {
        assert_eq!(
            block_on(timeout(Duration::ZERO, future::ready(7))),
            Some(7)
        );
        assert_eq!(
            block_on(timeout(Duration::from_millis(10), future::pending::<()>())),
            None
        );
    }
}
