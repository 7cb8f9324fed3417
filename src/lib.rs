//! Resumable keyword crawler for the bilibili web API.
//!
//! Given a search keyword the crawler discovers videos, fetches their detail
//! records, walks the two-level comment tree of each video and collects a
//! profile card for every user seen along the way. All records are streamed
//! to Kafka; append-only ID files and a per-video cursor checkpoint under
//! `sent_records/` make the crawl safe to interrupt and resume.

pub mod api;
pub mod config;
pub mod cookie;
pub mod crawler;
pub mod ratelimit;
pub mod sink;
pub mod storage;
