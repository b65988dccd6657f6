#![forbid(unsafe_code)]

//! YouTube acquisition service for a self-hosted media server.
//!
//! The interesting part is [`schedule`], which reconciles the nightly
//! subscription check with the system crontab. Everything else is storage,
//! yt-dlp glue and the HTTP layer in [`api`].

pub mod activity;
pub mod api;
pub mod channel;
pub mod config;
pub mod downloader;
pub mod error;
pub mod hardlink;
pub mod lock;
pub mod process;
pub mod schedule;
pub mod script;
pub mod security;
pub mod store;
