//! Segment worker: claims ranges from the table and streams them to disk.
//!
//! One OS thread per worker. Each claimed segment becomes a Range GET whose
//! body is written positionally at `offset + written`; the shared flags are
//! checked before every chunk so pause/cancel/removal take effect within one
//! chunk (at most 1 MiB) of being requested.

use std::cell::{Cell, RefCell};
use std::str;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::retry::{run_with_retry, WorkerError};
use crate::transfer::state::SharedTransfer;

/// Largest chunk handed to the write callback.
const CHUNK_CAP: usize = 1024 * 1024;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
/// Abort when the connection moves no data for this long (per-chunk timeout).
const STALL_TIMEOUT: Duration = Duration::from_secs(30);
/// Hard ceiling so a wedged transfer cannot hang a worker forever.
const HARD_TIMEOUT: Duration = Duration::from_secs(3600);

/// How one attempt at a segment ended, when it wasn't an error.
enum SegmentFate {
    /// Reached the segment boundary (or end-of-stream for unknown sizes).
    Completed,
    /// A stop flag was observed mid-transfer.
    Interrupted,
    /// Got 200 where 206 was required; segmented mode is invalid.
    SwitchSingle,
}

enum AbortReason {
    Interrupted,
    Switch,
    Boundary,
    Storage(std::io::Error),
}

/// Worker main loop: claim, transfer, repeat until no work or told to stop.
/// Decrements the shared active-worker count on the way out.
pub(super) fn worker_loop(shared: Arc<SharedTransfer>, worker_id: usize, stop: Arc<AtomicBool>) {
    loop {
        if stopped(&shared, &stop) {
            break;
        }
        let Some(index) = shared.table.lock().unwrap().claim_next(worker_id) else {
            break;
        };

        let fate = run_with_retry(
            &shared.retry,
            || stopped(&shared, &stop),
            || transfer_segment(&shared, index, worker_id, &stop),
        );

        match fate {
            Ok(SegmentFate::Completed) => {
                shared.table.lock().unwrap().complete(index);
            }
            Ok(SegmentFate::Interrupted) => {
                let mut table = shared.table.lock().unwrap();
                if stop.load(Ordering::Relaxed) && !shared.control.should_stop() {
                    // adaptive removal: hand the unwritten tail to the pool
                    table.hand_off(index);
                } else {
                    table.release(index);
                }
                break;
            }
            Ok(SegmentFate::SwitchSingle) => {
                shared.table.lock().unwrap().release(index);
                break;
            }
            Err(e) => {
                shared.table.lock().unwrap().release(index);
                if !stopped(&shared, &stop) {
                    tracing::warn!(worker = worker_id, error = %e, "segment failed, stopping job");
                    shared.control.fail(failure_message(&shared, &e));
                }
                break;
            }
        }
    }
    shared.active_workers.fetch_sub(1, Ordering::Relaxed);
}

/// Job-level failure message for a worker error. A short body after the
/// retry budget means the server keeps closing early; report what the job
/// as a whole has and note that the sidecar survives.
fn failure_message(shared: &SharedTransfer, e: &WorkerError) -> String {
    match e {
        WorkerError::ShortBody { .. } => {
            let written = shared.table.lock().unwrap().total_written();
            format!(
                "Download incomplete: {}/{} bytes received. Resume data saved.",
                written, shared.total
            )
        }
        other => other.user_message(),
    }
}

fn stopped(shared: &SharedTransfer, stop: &AtomicBool) -> bool {
    shared.control.should_stop()
        || stop.load(Ordering::Relaxed)
        || shared.switch_single.load(Ordering::Relaxed)
}

/// One GET attempt for the claimed segment. Ok carries the non-error fates;
/// Err is classified by the retry loop.
fn transfer_segment(
    shared: &Arc<SharedTransfer>,
    index: usize,
    worker_id: usize,
    stop: &Arc<AtomicBool>,
) -> Result<SegmentFate, WorkerError> {
    let (seg, use_range) = {
        let table = shared.table.lock().unwrap();
        (
            table.slot(index).segment,
            shared.ranged.load(Ordering::Relaxed),
        )
    };
    if seg.is_done() {
        return Ok(SegmentFate::Completed);
    }
    let start_pos = seg.offset + seg.written;
    let written_before = seg.written;

    let mut easy = curl::easy::Easy::new();
    easy.url(&shared.url).map_err(WorkerError::Curl)?;
    easy.follow_location(true).map_err(WorkerError::Curl)?;
    easy.max_redirections(10).map_err(WorkerError::Curl)?;
    easy.connect_timeout(CONNECT_TIMEOUT).map_err(WorkerError::Curl)?;
    easy.low_speed_limit(1).map_err(WorkerError::Curl)?;
    easy.low_speed_time(STALL_TIMEOUT).map_err(WorkerError::Curl)?;
    easy.timeout(HARD_TIMEOUT).map_err(WorkerError::Curl)?;
    easy.buffer_size(CHUNK_CAP).map_err(WorkerError::Curl)?;
    if use_range {
        let range = if seg.length == 0 {
            format!("{}-", start_pos)
        } else {
            format!("{}-{}", start_pos, seg.offset + seg.length - 1)
        };
        easy.range(&range).map_err(WorkerError::Curl)?;
    }

    let status = Cell::new(0u32);
    let retry_after = Cell::new(None::<Duration>);
    let abort = RefCell::new(None::<AbortReason>);

    {
        let mut transfer = easy.transfer();
        transfer
            .header_function(|data| {
                if let Ok(s) = str::from_utf8(data) {
                    let line = s.trim_end();
                    if line.starts_with("HTTP/") {
                        let code = line
                            .split_whitespace()
                            .nth(1)
                            .and_then(|c| c.parse().ok())
                            .unwrap_or(0);
                        status.set(code);
                    } else if let Some((name, value)) = line.split_once(':') {
                        if name.trim().eq_ignore_ascii_case("retry-after") {
                            retry_after.set(value.trim().parse().ok().map(Duration::from_secs));
                        }
                    }
                }
                true
            })
            .map_err(WorkerError::Curl)?;
        transfer
            .write_function(|data| {
                if stopped(shared, stop) {
                    *abort.borrow_mut() = Some(AbortReason::Interrupted);
                    return Ok(0);
                }
                let code = status.get();
                if use_range && code == 200 {
                    // Server ignored the Range header. Tolerable only for a
                    // sole worker streaming from offset 0.
                    if start_pos > 0 || seg.length < shared.total {
                        shared.switch_single.store(true, Ordering::Relaxed);
                        *abort.borrow_mut() = Some(AbortReason::Switch);
                        return Ok(0);
                    }
                } else if code != 0 && !(200..300).contains(&code) {
                    // drain the error body; status handled after perform
                    return Ok(data.len());
                }

                let (write_offset, want) = {
                    let table = shared.table.lock().unwrap();
                    let now = table.slot(index).segment;
                    let want = if now.length == 0 {
                        data.len() as u64
                    } else {
                        (data.len() as u64).min(now.remaining())
                    };
                    (now.offset + now.written, want)
                };
                if want == 0 {
                    *abort.borrow_mut() = Some(AbortReason::Boundary);
                    return Ok(0);
                }
                if let Err(e) = shared.part.write_at(write_offset, &data[..want as usize]) {
                    *abort.borrow_mut() = Some(AbortReason::Storage(e));
                    return Ok(0);
                }
                // A racing split can pull the boundary inward between the
                // write and this clamp; the tail's owner rewrites the same
                // bytes and accounting only counts what fit.
                let fit = shared.table.lock().unwrap().record_write(index, want);
                shared.record_bytes(worker_id, fit);
                shared.after_chunk();
                if want < data.len() as u64 {
                    *abort.borrow_mut() = Some(AbortReason::Boundary);
                    return Ok(want as usize);
                }
                Ok(data.len())
            })
            .map_err(WorkerError::Curl)?;

        if let Err(e) = transfer.perform() {
            return match abort.borrow_mut().take() {
                Some(AbortReason::Interrupted) => Ok(SegmentFate::Interrupted),
                Some(AbortReason::Switch) => Ok(SegmentFate::SwitchSingle),
                Some(AbortReason::Storage(io)) => Err(WorkerError::Storage(io)),
                Some(AbortReason::Boundary) => finish_attempt(shared, index, written_before),
                None => Err(WorkerError::Curl(e)),
            };
        }
    }

    let code = easy.response_code().map_err(WorkerError::Curl)? as u32;
    if !(200..300).contains(&code) {
        return Err(WorkerError::Http {
            code,
            retry_after: retry_after.get(),
        });
    }
    finish_attempt(shared, index, written_before)
}

/// Post-transfer completion check for a 2xx (or boundary-stopped) attempt.
fn finish_attempt(
    shared: &SharedTransfer,
    index: usize,
    written_before: u64,
) -> Result<SegmentFate, WorkerError> {
    let seg = shared.table.lock().unwrap().slot(index).segment;
    if seg.length == 0 {
        // unknown size: a clean end-of-stream is completion
        return Ok(SegmentFate::Completed);
    }
    if seg.remaining() == 0 {
        return Ok(SegmentFate::Completed);
    }
    Err(WorkerError::ShortBody {
        expected: seg.length - written_before,
        received: seg.written - written_before,
    })
}
