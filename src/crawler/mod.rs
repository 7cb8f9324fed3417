//! The four-stage crawl pipeline.
//!
//! Search discovery fans video stubs into a dedup pass; detail workers
//! emit video records and feed the comment stage; comment workers walk the
//! cursor-paginated root comments and spawn reply tasks; account workers
//! drain the MID discovery queue. Bounded queues give backpressure between
//! stages and the shutdown barrier closes them in pipeline order.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use async_channel::{Receiver, Sender};
use rand::Rng;
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::api::wbi::WbiSigner;
use crate::api::{ApiContext, RetryConfig, Session};
use crate::config::Config;
use crate::cookie::CookiePool;
use crate::ratelimit;
use crate::sink::{Emitter, KafkaSink, MessageSink};
use crate::storage::{RecordKind, RecordStore, VideoProgress};

pub const SEARCH_PAGE_SIZE: usize = 50;
const REPLY_PAGE_SIZE: usize = 20;

const VIDEO_QUEUE_DEPTH: usize = 100;
const COMMENT_QUEUE_DEPTH: usize = 500;
const MID_QUEUE_DEPTH: usize = 1000;

/// End-of-run counters, incremented per item from any worker.
#[derive(Debug, Default)]
pub struct CrawlStats {
    videos_saved: AtomicUsize,
    comments_saved: AtomicUsize,
    replies_saved: AtomicUsize,
    accounts_saved: AtomicUsize,
    videos_skipped: AtomicUsize,
    comments_skipped: AtomicUsize,
    accounts_skipped: AtomicUsize,
}

impl CrawlStats {
    pub fn videos_saved(&self) -> usize {
        self.videos_saved.load(Ordering::Relaxed)
    }

    pub fn comments_saved(&self) -> usize {
        self.comments_saved.load(Ordering::Relaxed)
    }

    pub fn replies_saved(&self) -> usize {
        self.replies_saved.load(Ordering::Relaxed)
    }

    pub fn accounts_saved(&self) -> usize {
        self.accounts_saved.load(Ordering::Relaxed)
    }

    pub fn videos_skipped(&self) -> usize {
        self.videos_skipped.load(Ordering::Relaxed)
    }

    pub fn comments_skipped(&self) -> usize {
        self.comments_skipped.load(Ordering::Relaxed)
    }

    pub fn accounts_skipped(&self) -> usize {
        self.accounts_skipped.load(Ordering::Relaxed)
    }

    fn report(&self, remaining_mids: usize) {
        info!(
            videos_saved = self.videos_saved(),
            videos_skipped = self.videos_skipped(),
            comments_saved = self.comments_saved(),
            comments_skipped = self.comments_skipped(),
            replies_saved = self.replies_saved(),
            total_comments = self.comments_saved() + self.replies_saved(),
            accounts_saved = self.accounts_saved(),
            accounts_skipped = self.accounts_skipped(),
            remaining_mids,
            "crawl finished"
        );
    }
}

/// Process-wide dedup sets mirroring the durable store plus in-flight
/// discoveries. Critical sections are O(1) set operations; no I/O happens
/// under these locks.
#[derive(Debug, Default)]
struct CrawlState {
    sent_bvids: Mutex<HashSet<String>>,
    sent_rpids: Mutex<HashSet<String>>,
    sent_mids: Mutex<HashSet<String>>,
    discovered_mids: Mutex<HashSet<String>>,
}

impl CrawlState {
    fn bvid_sent(&self, bvid: &str) -> bool {
        self.sent_bvids.lock().expect("state lock poisoned").contains(bvid)
    }

    fn mark_bvid(&self, bvid: &str) {
        self.sent_bvids
            .lock()
            .expect("state lock poisoned")
            .insert(bvid.to_string());
    }

    fn rpid_sent(&self, rpid: &str) -> bool {
        self.sent_rpids.lock().expect("state lock poisoned").contains(rpid)
    }

    fn mark_rpid(&self, rpid: &str) {
        self.sent_rpids
            .lock()
            .expect("state lock poisoned")
            .insert(rpid.to_string());
    }

    fn mid_sent(&self, mid: &str) -> bool {
        self.sent_mids.lock().expect("state lock poisoned").contains(mid)
    }

    fn mark_mid(&self, mid: &str) {
        self.sent_mids
            .lock()
            .expect("state lock poisoned")
            .insert(mid.to_string());
    }

    /// First-time discovery check: inserts and reports whether the MID was
    /// new.
    fn discover(&self, mid: &str) -> bool {
        self.discovered_mids
            .lock()
            .expect("state lock poisoned")
            .insert(mid.to_string())
    }

    fn remaining_mids(&self) -> HashSet<String> {
        let discovered = self.discovered_mids.lock().expect("state lock poisoned");
        let sent = self.sent_mids.lock().expect("state lock poisoned");
        discovered.difference(&sent).cloned().collect()
    }
}

struct VideoTask {
    detail: Value,
}

struct CommentTask {
    aid: i64,
    comment: Value,
}

/// Shared handles cloned into every worker.
#[derive(Clone)]
struct WorkerEnv {
    config: Arc<Config>,
    store: Arc<RecordStore>,
    emitter: Arc<Emitter>,
    state: Arc<CrawlState>,
    stats: Arc<CrawlStats>,
}

pub struct Crawler {
    config: Arc<Config>,
    ctx: Arc<ApiContext>,
    store: Arc<RecordStore>,
    emitter: Arc<Emitter>,
    state: Arc<CrawlState>,
    stats: Arc<CrawlStats>,
    start_progress: HashMap<String, VideoProgress>,
}

impl Crawler {
    /// Crawler wired to the Kafka sink.
    pub fn new(config: Config) -> Result<Self> {
        let sink: Arc<dyn MessageSink> = Arc::new(KafkaSink::from_env()?);
        Self::with_sink(config, sink)
    }

    /// Crawler with an explicit sink; this is the seam the tests use.
    pub fn with_sink(config: Config, sink: Arc<dyn MessageSink>) -> Result<Self> {
        config.validate()?;

        let limiter = ratelimit::init(config.rate_limit_rate, config.rate_limit_capacity);
        let cookies = Arc::new(CookiePool::from_file(Path::new(&config.cookie_config_path)));
        let signer = Arc::new(WbiSigner::new());
        let ctx = Arc::new(ApiContext {
            base_url: config.api_base_url.trim_end_matches('/').to_string(),
            portal_url: config.portal_url.clone(),
            user_agent: config.user_agent.clone(),
            limiter,
            cookies,
            signer,
            retry: RetryConfig::default(),
        });

        let store = Arc::new(RecordStore::new(&config.record_dir));
        let emitter = Arc::new(Emitter::new(sink, Arc::clone(&store)));

        let mut start_progress = HashMap::new();
        let state = if config.resume {
            let sent_bvids = store
                .load_emitted(RecordKind::Video)
                .context("failed to load emitted video ids")?;
            let sent_rpids = store
                .load_emitted(RecordKind::Comment)
                .context("failed to load emitted comment ids")?;
            let sent_mids = store
                .load_emitted(RecordKind::Account)
                .context("failed to load emitted account ids")?;
            start_progress = store
                .load_all_progress()
                .context("failed to load comment progress")?;
            CrawlState {
                sent_bvids: Mutex::new(sent_bvids),
                sent_rpids: Mutex::new(sent_rpids),
                sent_mids: Mutex::new(sent_mids),
                discovered_mids: Mutex::new(HashSet::new()),
            }
        } else {
            CrawlState::default()
        };

        Ok(Self {
            config: Arc::new(config),
            ctx,
            store,
            emitter,
            state: Arc::new(state),
            stats: Arc::new(CrawlStats::default()),
            start_progress,
        })
    }

    pub fn stats(&self) -> &CrawlStats {
        &self.stats
    }

    fn announce(&self) {
        info!(
            keyword = %self.config.keyword,
            threads = self.config.n_threads,
            expected_videos = self.config.n_threads * self.config.pages_per_thread * SEARCH_PAGE_SIZE,
            resume = self.config.resume,
            "starting crawl"
        );
        let status = self.ctx.cookies.status();
        info!(
            total = status.total,
            enabled = status.enabled,
            valid = status.valid,
            strategy = ?status.strategy,
            "credential pool loaded"
        );
        if self.config.resume && !self.start_progress.is_empty() {
            let done = self.start_progress.values().filter(|p| p.done).count();
            let interrupted = self
                .start_progress
                .values()
                .filter(|p| !p.done && !p.cursor.is_empty())
                .count();
            info!(done, interrupted, "comment progress restored");
        }
    }

    /// Drive the full pipeline to completion.
    pub async fn run(&self) -> Result<()> {
        self.announce();

        let env = WorkerEnv {
            config: Arc::clone(&self.config),
            store: Arc::clone(&self.store),
            emitter: Arc::clone(&self.emitter),
            state: Arc::clone(&self.state),
            stats: Arc::clone(&self.stats),
        };

        let (video_tx, video_rx) = async_channel::bounded::<VideoTask>(VIDEO_QUEUE_DEPTH);
        let (comment_tx, comment_rx) = async_channel::bounded::<CommentTask>(COMMENT_QUEUE_DEPTH);
        let (mid_tx, mid_rx) = async_channel::bounded::<String>(MID_QUEUE_DEPTH);

        if self.config.resume && self.config.resume_pending_mids {
            self.restore_pending_mids(&mid_tx);
        }

        let n = self.config.n_threads;
        let mut comment_handles = Vec::with_capacity(n);
        for worker in 0..n {
            let session = Session::connect(Arc::clone(&self.ctx))
                .await
                .context("failed to create comment session")?;
            comment_handles.push(tokio::spawn(comment_worker(
                worker,
                env.clone(),
                session,
                video_rx.clone(),
                comment_tx.clone(),
                mid_tx.clone(),
            )));
        }

        let mut reply_handles = Vec::with_capacity(n);
        for worker in 0..n {
            let session = Session::connect(Arc::clone(&self.ctx))
                .await
                .context("failed to create reply session")?;
            reply_handles.push(tokio::spawn(reply_worker(
                worker,
                env.clone(),
                session,
                comment_rx.clone(),
                mid_tx.clone(),
            )));
        }

        let mut account_handles = Vec::with_capacity(n);
        for worker in 0..n {
            let session = Session::connect(Arc::clone(&self.ctx))
                .await
                .context("failed to create account session")?;
            account_handles.push(tokio::spawn(account_worker(
                worker,
                env.clone(),
                session,
                mid_rx.clone(),
            )));
        }

        self.search_and_fetch_details(&env, &video_tx, &mid_tx)
            .await?;

        // Shutdown barrier: close each queue once everything upstream of it
        // has been joined, then join its consumers.
        drop(video_tx);
        join_workers(comment_handles, "comment").await;
        info!(
            saved = self.stats.comments_saved(),
            "top-level comment crawl complete"
        );

        drop(comment_tx);
        join_workers(reply_handles, "reply").await;
        info!(saved = self.stats.replies_saved(), "reply crawl complete");

        drop(mid_tx);
        join_workers(account_handles, "account").await;
        info!(
            saved = self.stats.accounts_saved(),
            "account crawl complete"
        );

        let remaining = self.state.remaining_mids();
        self.store
            .update_pending(&remaining)
            .context("failed to update pending mids")?;
        self.stats.report(remaining.len());
        Ok(())
    }

    /// Parallel search, dedup by BVID, then detail workers over the fresh
    /// stubs. Already-emitted videos skip the detail fetch but still enter
    /// the comment stage.
    async fn search_and_fetch_details(
        &self,
        env: &WorkerEnv,
        video_tx: &Sender<VideoTask>,
        mid_tx: &Sender<String>,
    ) -> Result<()> {
        let n = self.config.n_threads;
        let capacity = (n * self.config.pages_per_thread * SEARCH_PAGE_SIZE).max(1);
        let (results_tx, results_rx) = async_channel::bounded::<Value>(capacity);

        let mut search_handles = Vec::with_capacity(n);
        for worker in 0..n {
            let session = Session::connect(Arc::clone(&self.ctx))
                .await
                .context("failed to create search session")?;
            search_handles.push(tokio::spawn(search_worker(
                worker,
                env.clone(),
                session,
                results_tx.clone(),
            )));
        }
        // The channel closes once the last search worker drops its sender.
        drop(results_tx);

        let mut seen = HashSet::new();
        let mut fresh: Vec<Value> = Vec::new();
        while let Ok(stub) = results_rx.recv().await {
            let Some(bvid) = field_id(&stub, "bvid") else {
                continue;
            };
            if !seen.insert(bvid.clone()) {
                continue;
            }
            if self.config.resume && self.state.bvid_sent(&bvid) {
                // Already on the bus; comments may still be unfinished.
                self.stats.videos_skipped.fetch_add(1, Ordering::Relaxed);
                if video_tx.send(VideoTask { detail: stub }).await.is_err() {
                    break;
                }
            } else {
                fresh.push(stub);
            }
        }
        join_workers(search_handles, "search").await;

        info!(count = fresh.len(), "new videos discovered");
        if fresh.is_empty() {
            return Ok(());
        }

        let (stub_tx, stub_rx) = async_channel::bounded::<Value>(fresh.len());
        for stub in fresh {
            // Capacity equals the stub count, so this never blocks.
            let _ = stub_tx.send(stub).await;
        }
        drop(stub_tx);

        let mut detail_handles = Vec::with_capacity(n);
        for worker in 0..n {
            let session = Session::connect(Arc::clone(&self.ctx))
                .await
                .context("failed to create detail session")?;
            detail_handles.push(tokio::spawn(detail_worker(
                worker,
                env.clone(),
                session,
                stub_rx.clone(),
                video_tx.clone(),
                mid_tx.clone(),
            )));
        }
        join_workers(detail_handles, "detail").await;
        Ok(())
    }

    fn restore_pending_mids(&self, mid_tx: &Sender<String>) {
        let pending = match self.store.load_pending() {
            Ok(pending) => pending,
            Err(e) => {
                warn!(error = %e, "failed to load pending mids");
                return;
            }
        };
        let mut restored = 0;
        for mid in pending {
            if self.state.mid_sent(&mid) {
                continue;
            }
            self.state.discover(&mid);
            if mid_tx.try_send(mid).is_ok() {
                restored += 1;
            }
        }
        if restored > 0 {
            info!(count = restored, "restored pending user mids");
        }
    }
}

async fn join_workers(handles: Vec<JoinHandle<()>>, stage: &str) {
    for handle in handles {
        if let Err(e) = handle.await {
            error!(stage, "worker task panicked: {e}");
        }
    }
}

/// Search stage: fetch this worker's share of search pages and fan the
/// stubs into the dedup pass.
async fn search_worker(worker: usize, env: WorkerEnv, session: Session, results_tx: Sender<Value>) {
    for page in 1..=env.config.pages_per_thread {
        let actual_page = worker * env.config.pages_per_thread + page;
        debug!(worker, page = actual_page, "fetching search page");
        match session
            .search_videos(&env.config.keyword, actual_page, SEARCH_PAGE_SIZE)
            .await
        {
            Ok(result) => {
                info!(
                    worker,
                    page = actual_page,
                    videos = result.videos.len(),
                    "search page fetched"
                );
                for video in result.videos {
                    if results_tx.send(video).await.is_err() {
                        return;
                    }
                }
            }
            Err(e) => warn!(worker, page = actual_page, error = %e, "search page failed"),
        }
        politeness_sleep(&env.config).await;
    }
}

/// Detail stage: fetch the detail record, emit it, discover the owner and
/// hand the video to the comment stage.
async fn detail_worker(
    worker: usize,
    env: WorkerEnv,
    session: Session,
    stubs_rx: Receiver<Value>,
    video_tx: Sender<VideoTask>,
    mid_tx: Sender<String>,
) {
    while let Ok(stub) = stubs_rx.recv().await {
        let Some(bvid) = field_id(&stub, "bvid") else {
            continue;
        };
        match session.video_detail(&bvid).await {
            Err(e) => warn!(worker, bvid = %bvid, error = %e, "video detail failed"),
            Ok(mut detail) => {
                if let Some(object) = detail.as_object_mut() {
                    object.insert(
                        "topic_keyword".to_string(),
                        Value::String(env.config.keyword.clone()),
                    );
                }
                match env.emitter.emit(RecordKind::Video, &bvid, &detail).await {
                    Err(e) => warn!(worker, bvid = %bvid, error = %e, "failed to emit video"),
                    Ok(()) => {
                        env.stats.videos_saved.fetch_add(1, Ordering::Relaxed);
                        env.state.mark_bvid(&bvid);
                        if let Some(mid) =
                            detail.pointer("/owner/mid").and_then(json_id)
                        {
                            discover_mid(&env, &mid_tx, &mid);
                        }
                        debug!(worker, bvid = %bvid, "video emitted, queueing comments");
                        if video_tx.send(VideoTask { detail }).await.is_err() {
                            return;
                        }
                    }
                }
            }
        }
        politeness_sleep(&env.config).await;
    }
}

/// Comment stage: walk the cursor-paginated root comments of one video,
/// checkpointing the cursor after each page so an interruption resumes
/// where it left off.
async fn comment_worker(
    worker: usize,
    env: WorkerEnv,
    session: Session,
    video_rx: Receiver<VideoTask>,
    comment_tx: Sender<CommentTask>,
    mid_tx: Sender<String>,
) {
    while let Ok(task) = video_rx.recv().await {
        let Some(bvid) = field_id(&task.detail, "bvid") else {
            continue;
        };

        let progress = env.store.get_progress(&bvid).unwrap_or_default();
        if env.config.resume && progress.done {
            debug!(worker, bvid = %bvid, "comments already crawled, skipping");
            continue;
        }

        let mut aid = task
            .detail
            .get("aid")
            .and_then(json_int)
            .unwrap_or(0);
        if aid == 0 {
            if progress.aid != 0 {
                aid = progress.aid;
            } else {
                match session.video_aid(&bvid).await {
                    Ok(resolved) => {
                        aid = resolved;
                        politeness_sleep(&env.config).await;
                    }
                    Err(e) => {
                        warn!(worker, bvid = %bvid, error = %e, "failed to resolve aid");
                        continue;
                    }
                }
            }
        }

        let mut cursor = if env.config.resume {
            progress.cursor.clone()
        } else {
            String::new()
        };
        if cursor.is_empty() {
            info!(worker, bvid = %bvid, aid, "crawling comments");
        } else {
            info!(worker, bvid = %bvid, aid, "resuming comment crawl from checkpoint");
        }

        let mut fetched = 0usize;
        loop {
            let page = match session.main_comments(aid, &cursor).await {
                Ok(page) => page,
                Err(e) => {
                    warn!(worker, bvid = %bvid, error = %e, "comment page failed, checkpoint kept");
                    if let Err(e) = env.store.save_progress(&bvid, &cursor, aid) {
                        error!(bvid = %bvid, "failed to save comment progress: {e:#}");
                    }
                    break;
                }
            };

            for reply in &page.replies {
                let Some(rpid) = field_id(reply, "rpid") else {
                    continue;
                };
                if let Some(mid) = reply.get("mid").and_then(json_id) {
                    discover_mid(&env, &mid_tx, &mid);
                }

                if env.config.resume && env.state.rpid_sent(&rpid) {
                    env.stats.comments_skipped.fetch_add(1, Ordering::Relaxed);
                    if reply_count(reply) > 0 {
                        let _ = comment_tx
                            .send(CommentTask {
                                aid,
                                comment: reply.clone(),
                            })
                            .await;
                    }
                    continue;
                }

                match env.emitter.emit(RecordKind::Comment, &rpid, reply).await {
                    Ok(()) => {
                        env.stats.comments_saved.fetch_add(1, Ordering::Relaxed);
                        env.state.mark_rpid(&rpid);
                        fetched += 1;
                        if reply_count(reply) > 0 {
                            let _ = comment_tx
                                .send(CommentTask {
                                    aid,
                                    comment: reply.clone(),
                                })
                                .await;
                        }
                    }
                    Err(e) => warn!(worker, rpid = %rpid, error = %e, "failed to emit comment"),
                }
            }

            if page.is_end || page.replies.is_empty() {
                if let Err(e) = env.store.mark_done(&bvid) {
                    error!(bvid = %bvid, "failed to mark comments done: {e:#}");
                }
                break;
            }

            cursor = page.next_cursor;
            if let Err(e) = env.store.save_progress(&bvid, &cursor, aid) {
                error!(bvid = %bvid, "failed to save comment progress: {e:#}");
            }
            politeness_sleep(&env.config).await;
        }

        info!(worker, bvid = %bvid, comments = fetched, "comment crawl finished");
    }
}

/// Reply stage: page through the replies of one parent comment. Terminates
/// on an empty page or when the cumulative fetched count (including
/// resume-skipped replies) reaches the server-reported total.
async fn reply_worker(
    worker: usize,
    env: WorkerEnv,
    session: Session,
    comment_rx: Receiver<CommentTask>,
    mid_tx: Sender<String>,
) {
    while let Ok(task) = comment_rx.recv().await {
        let Some(root) = task.comment.get("rpid").and_then(json_int) else {
            continue;
        };
        let expected = reply_count(&task.comment);
        debug!(worker, root, expected, "crawling replies");

        let mut page = 1usize;
        let mut total_fetched: i64 = 0;
        loop {
            let result = match session
                .comment_replies(task.aid, root, page, REPLY_PAGE_SIZE)
                .await
            {
                Ok(result) => result,
                Err(e) => {
                    warn!(worker, root, error = %e, "reply page failed");
                    break;
                }
            };
            if result.replies.is_empty() {
                break;
            }

            for reply in &result.replies {
                let Some(rpid) = field_id(reply, "rpid") else {
                    continue;
                };
                if let Some(mid) = reply.get("mid").and_then(json_id) {
                    discover_mid(&env, &mid_tx, &mid);
                }

                if env.config.resume && env.state.rpid_sent(&rpid) {
                    total_fetched += 1;
                    continue;
                }

                match env.emitter.emit(RecordKind::Comment, &rpid, reply).await {
                    Ok(()) => {
                        env.stats.replies_saved.fetch_add(1, Ordering::Relaxed);
                        env.state.mark_rpid(&rpid);
                        total_fetched += 1;
                    }
                    Err(e) => warn!(worker, rpid = %rpid, error = %e, "failed to emit reply"),
                }
            }

            if total_fetched >= result.total {
                break;
            }
            page += 1;
            politeness_sleep(&env.config).await;
        }

        debug!(worker, root, replies = total_fetched, "reply crawl finished");
    }
}

/// Account stage: fetch the profile card for each discovered MID.
async fn account_worker(worker: usize, env: WorkerEnv, session: Session, mid_rx: Receiver<String>) {
    while let Ok(mid) = mid_rx.recv().await {
        if env.config.resume && env.state.mid_sent(&mid) {
            env.stats.accounts_skipped.fetch_add(1, Ordering::Relaxed);
            continue;
        }

        match session.user_card(&mid).await {
            Err(e) => warn!(worker, mid = %mid, error = %e, "user card fetch failed"),
            Ok(card) => match env.emitter.emit(RecordKind::Account, &mid, &card).await {
                Ok(()) => {
                    env.stats.accounts_saved.fetch_add(1, Ordering::Relaxed);
                    env.state.mark_mid(&mid);
                    debug!(worker, mid = %mid, "account emitted");
                }
                Err(e) => warn!(worker, mid = %mid, error = %e, "failed to emit account"),
            },
        }
        politeness_sleep(&env.config).await;
    }
}

/// Register a discovered MID. The pending file is written before the queue
/// send so a full queue only delays the account fetch to a later run
/// instead of losing it.
fn discover_mid(env: &WorkerEnv, mid_tx: &Sender<String>, mid: &str) {
    if !env.state.discover(mid) {
        return;
    }
    if env.config.resume && env.state.mid_sent(mid) {
        return;
    }
    if let Err(e) = env.store.save_pending(mid) {
        warn!(mid = %mid, error = %e, "failed to persist pending mid");
    }
    let _ = mid_tx.try_send(mid.to_string());
}

async fn politeness_sleep(config: &Config) {
    if config.delay_max <= 0.0 {
        return;
    }
    let delay = {
        let mut rng = rand::thread_rng();
        config.delay_min + rng.gen::<f64>() * (config.delay_max - config.delay_min).max(0.0)
    };
    if delay > 0.0 {
        tokio::time::sleep(Duration::from_secs_f64(delay)).await;
    }
}

/// Normalize a JSON identifier that may arrive as a number or a string.
fn json_id(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn field_id(value: &Value, key: &str) -> Option<String> {
    value.get(key).and_then(json_id)
}

/// Integer extraction tolerant of float-encoded JSON numbers.
fn json_int(value: &Value) -> Option<i64> {
    value
        .as_i64()
        .or_else(|| value.as_f64().map(|f| f as i64))
}

fn reply_count(comment: &Value) -> i64 {
    comment.get("rcount").and_then(json_int).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn json_id_normalizes_numbers_and_strings() {
        assert_eq!(json_id(&json!("BV1")), Some("BV1".to_string()));
        assert_eq!(json_id(&json!(12345)), Some("12345".to_string()));
        assert_eq!(json_id(&json!("")), None);
        assert_eq!(json_id(&json!(null)), None);
    }

    #[test]
    fn field_id_reads_nested_keys() {
        let stub = json!({"bvid": "BV1", "owner": {"mid": 7}});
        assert_eq!(field_id(&stub, "bvid"), Some("BV1".to_string()));
        assert_eq!(stub.pointer("/owner/mid").and_then(json_id), Some("7".to_string()));
    }

    #[test]
    fn reply_count_tolerates_missing_and_float_values() {
        assert_eq!(reply_count(&json!({"rcount": 3})), 3);
        assert_eq!(reply_count(&json!({"rcount": 3.0})), 3);
        assert_eq!(reply_count(&json!({})), 0);
    }

    #[test]
    fn remaining_mids_is_discovered_minus_sent() {
        let state = CrawlState::default();
        state.discover("m1");
        state.discover("m2");
        state.discover("m3");
        state.mark_mid("m2");
        let remaining = state.remaining_mids();
        assert_eq!(remaining.len(), 2);
        assert!(remaining.contains("m1"));
        assert!(remaining.contains("m3"));
    }

    #[test]
    fn discover_reports_first_sighting_only() {
        let state = CrawlState::default();
        assert!(state.discover("m1"));
        assert!(!state.discover("m1"));
    }
}
