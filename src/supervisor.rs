use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::engine::{Engine, ExitOutcome, TranscoderHandle, TranscoderOutput};
use crate::error::{Error, Result};
use crate::retry::{Sleeper, StreamBackoff, TokioSleeper};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Stop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptEnd {
    Stopped,
    /// 正常退出或被回收，重新连接
    CleanExit,
}

#[async_trait]
pub trait StreamAttempt: Send {
    async fn run_once(&mut self) -> Result<AttemptEnd>;
}

/// 带退避的重启循环：正常退出清零计数，连续失败超过上限则放弃
pub async fn run_with_restarts(
    attempt: &mut dyn StreamAttempt,
    backoff: &StreamBackoff,
    sleeper: &dyn Sleeper,
    pause: Duration,
    channel_id: i64,
) -> Result<()> {
    let mut retry_count: u32 = 0;

    loop {
        match attempt.run_once().await {
            Ok(AttemptEnd::Stopped) => return Ok(()),
            Ok(AttemptEnd::CleanExit) => {
                if retry_count > 0 {
                    info!(channel_id, "stream recovered after {} failures", retry_count);
                }
                retry_count = 0;
                sleeper.sleep(pause).await;
            }
            Err(e) if e.is_transient_stream_failure() => {
                retry_count += 1;
                match backoff.delay_for(retry_count) {
                    Some(delay) => {
                        warn!(
                            "Stream [{}] failed: {}. Retry {}/{}. Backing off for {}s.",
                            channel_id,
                            e,
                            retry_count,
                            backoff.max_retries,
                            delay.as_secs()
                        );
                        sleeper.sleep(delay).await;
                    }
                    None => {
                        error!(
                            "Stream [{}] reached max retry attempts ({}). Giving up.",
                            channel_id, backoff.max_retries
                        );
                        return Err(Error::RetriesExhausted {
                            retries: backoff.max_retries,
                            last: e.to_string(),
                        });
                    }
                }
            }
            Err(e) => return Err(e),
        }
    }
}

/// 把频道的转码输出交给 `on_data`，直到返回 [`Flow::Stop`]
pub async fn stream_loop<F>(engine: &Engine, channel_id: i64, source_url: &str, on_data: F) -> Result<()>
where
    F: FnMut(Bytes) -> Flow + Send,
{
    stream_loop_with(engine, &TokioSleeper, channel_id, source_url, on_data).await
}

pub async fn stream_loop_with<F>(
    engine: &Engine,
    sleeper: &dyn Sleeper,
    channel_id: i64,
    source_url: &str,
    on_data: F,
) -> Result<()>
where
    F: FnMut(Bytes) -> Flow + Send,
{
    let mut attempt = EngineAttempt {
        engine,
        channel_id,
        source_url,
        max_silence: engine.max_silence(),
        on_data,
    };
    let pause = Duration::from_millis(engine.config().restart_pause_ms);
    run_with_restarts(&mut attempt, &engine.backoff(), sleeper, pause, channel_id).await
}

struct EngineAttempt<'a, F> {
    engine: &'a Engine,
    channel_id: i64,
    source_url: &'a str,
    max_silence: Duration,
    on_data: F,
}

impl<'a, F> EngineAttempt<'a, F>
where
    F: FnMut(Bytes) -> Flow + Send,
{
    async fn deliver(&mut self, handle: &Arc<TranscoderHandle>, chunk: Bytes) -> bool {
        if (self.on_data)(chunk) == Flow::Continue {
            return true;
        }
        // Our own receiver is still counted here.
        if handle.listeners() <= 1 {
            self.engine.stop_handle(handle).await;
        }
        false
    }
}

#[async_trait]
impl<'a, F> StreamAttempt for EngineAttempt<'a, F>
where
    F: FnMut(Bytes) -> Flow + Send,
{
    async fn run_once(&mut self) -> Result<AttemptEnd> {
        let handle = self.engine.start(self.channel_id, self.source_url).await?;
        let TranscoderOutput { mut chunks, mut exit } = handle.subscribe();
        let mut last_output = Instant::now();

        loop {
            tokio::select! {
                biased;
                chunk = chunks.recv() => match chunk {
                    Ok(bytes) if bytes.is_empty() => {}
                    Ok(bytes) => {
                        last_output = Instant::now();
                        if !self.deliver(&handle, bytes).await {
                            return Ok(AttemptEnd::Stopped);
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(channel_id = self.channel_id, skipped, "listener fell behind");
                    }
                    Err(RecvError::Closed) => break,
                },
                _ = exit.changed() => break,
                _ = tokio::time::sleep_until(last_output + self.max_silence) => {
                    self.engine.recycle(&handle).await;
                    return Err(Error::ProcessStalled(self.max_silence.as_secs()));
                }
            }
        }

        // Output written before the exit was published is still queued.
        while let Ok(bytes) = chunks.try_recv() {
            if !bytes.is_empty() && !self.deliver(&handle, bytes).await {
                return Ok(AttemptEnd::Stopped);
            }
        }

        match handle.exit_outcome() {
            Some(ExitOutcome::Success) | Some(ExitOutcome::Recycled) => Ok(AttemptEnd::CleanExit),
            Some(ExitOutcome::Stopped) => Ok(AttemptEnd::Stopped),
            Some(ExitOutcome::Failure(status)) => Err(Error::ProcessExitedAbnormally(status)),
            None => Err(Error::ProcessExitedAbnormally("transcoder output closed".to_string())),
        }
    }
}
