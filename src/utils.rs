// Copyright 2022 TiKV Project Authors. Licensed under Apache-2.0.

use std::{future::Future, time::Duration};

use crate::errors::{Error, Result};

/// A fixed interval between retry attempts of a remote operation.
#[derive(Clone, Copy, Debug)]
pub struct FixedBackoff(pub Duration);

/// Run `op` until it succeeds or `count` attempts are exhausted, sleeping
/// `backoff` between attempts. Exhaustion surfaces the single
/// [`Error::RetryTimeout`] sentinel; a `RetryTimeout` bubbling out of `op`
/// itself is passed through untouched rather than re-retried.
pub async fn retry<T, F, Fut>(backoff: FixedBackoff, count: usize, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt: usize = 0;
    loop {
        match op().await {
            Ok(v) => return Ok(v),
            Err(Error::RetryTimeout) => return Err(Error::RetryTimeout),
            Err(err) => {
                attempt += 1;
                if attempt >= count {
                    warn!("retry budget exhausted"; "attempts" => attempt, "err" => %err);
                    return Err(Error::RetryTimeout);
                }
                debug!("retrying remote operation"; "attempt" => attempt, "err" => %err);
                tokio::time::sleep(backoff.0).await;
            }
        }
    }
}

/// Render a vbucket list as condensed ranges, e.g. `[0-3, 7, 9-10]`.
/// Keeps ownership dumps in the logs readable at 1024 vbuckets.
pub fn condense(vbs: &[u16]) -> String {
    if vbs.is_empty() {
        return "[]".to_owned();
    }
    let mut out = String::from("[");
    let mut start = vbs[0];
    let mut prev = vbs[0];
    let mut flush = |out: &mut String, start: u16, prev: u16| {
        if !out.ends_with('[') {
            out.push_str(", ");
        }
        if start == prev {
            out.push_str(&start.to_string());
        } else {
            out.push_str(&format!("{}-{}", start, prev));
        }
    };
    for &vb in &vbs[1..] {
        if vb == prev + 1 {
            prev = vb;
            continue;
        }
        flush(&mut out, start, prev);
        start = vb;
        prev = vb;
    }
    flush(&mut out, start, prev);
    out.push(']');
    out
}

/// Elements of `from` that are not in `exclude`, preserving `from`'s order.
pub fn vbs_diff(exclude: &[u16], from: &[u16]) -> Vec<u16> {
    from.iter()
        .copied()
        .filter(|vb| !exclude.contains(vb))
        .collect()
}

/// Append `vb` to an ordered pending queue unless already present.
pub fn push_dedup(queue: &mut Vec<u16>, vb: u16) {
    if !queue.contains(&vb) {
        queue.push(vb);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_condense() {
        assert_eq!(condense(&[]), "[]");
        assert_eq!(condense(&[5]), "[5]");
        assert_eq!(condense(&[0, 1, 2, 3]), "[0-3]");
        assert_eq!(condense(&[0, 1, 2, 7, 9, 10]), "[0-2, 7, 9-10]");
    }

    #[test]
    fn test_vbs_diff() {
        assert_eq!(vbs_diff(&[2, 4], &[1, 2, 3, 4, 5]), vec![1, 3, 5]);
        assert_eq!(vbs_diff(&[], &[1, 2]), vec![1, 2]);
        assert_eq!(vbs_diff(&[1, 2], &[]), Vec::<u16>::new());
    }

    #[test]
    fn test_push_dedup() {
        let mut q = vec![1, 2];
        push_dedup(&mut q, 2);
        push_dedup(&mut q, 3);
        assert_eq!(q, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_retry_exhaustion_yields_timeout() {
        let res: Result<()> = retry(
            FixedBackoff(std::time::Duration::from_millis(1)),
            3,
            || async { Err(Error::Other("transient".to_owned())) },
        )
        .await;
        assert!(matches!(res, Err(Error::RetryTimeout)));
    }

    #[tokio::test]
    async fn test_retry_recovers() {
        let mut failures = 2;
        let res = retry(
            FixedBackoff(std::time::Duration::from_millis(1)),
            5,
            move || {
                let fail = failures > 0;
                failures -= 1;
                async move {
                    if fail {
                        Err(Error::Other("transient".to_owned()))
                    } else {
                        Ok(42u64)
                    }
                }
            },
        )
        .await;
        assert_eq!(res.unwrap(), 42);
    }
}
