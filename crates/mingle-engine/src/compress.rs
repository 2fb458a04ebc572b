//! The daily compression job.
//!
//! Once at engine start and then at every local 23:55, fold each past day's
//! archived summary sections — across every target the engine has ever
//! known — into one daily digest document. Failed days are left in place and
//! retried on the next run.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Local};
use tracing::debug;

use mingle_core::events::LogLevel;
use mingle_docs::group_buffer::{self, Section};
use mingle_docs::{meta, targets};
use mingle_llm::{ChatRequest, HistoryItem, Turn};

use crate::runtime::Runtime;

/// Digest requests run cool: the output is an archival summary.
const DIGEST_TEMPERATURE: f64 = 0.3;
const DIGEST_MAX_TOKENS: u32 = 1024;

const DIGEST_SYSTEM_PROMPT: &str = "\
你是一个聊天记录归档助手。根据给出的某一天的各群聊摘要片段，\
写一份不超过 500 字的纯文本当日总结：谁聊了什么、有什么值得记住的事。\
不要使用列表符号以外的任何格式标记。";

pub async fn run(rt: Arc<Runtime>) {
    run_once(&rt).await;
    loop {
        let delay = duration_until_next_run(Local::now());
        tokio::select! {
            _ = rt.cancel.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
        if !rt.live() {
            break;
        }
        run_once(&rt).await;
    }
    debug!("daily compression loop exited");
}

/// One compression run. Returns the number of digests written.
pub async fn run_once(rt: &Runtime) -> usize {
    let docs = &rt.deps.docs;
    let config = rt.config();

    // Merge the live config into the persisted known-target list so removed
    // targets still get their backlog digested.
    let mut known = targets::load_known_targets(docs);
    let names = rt.target_names();
    targets::merge_known_targets(
        &mut known,
        config
            .targets()
            .into_iter()
            .map(|t| (t.id.as_str().to_string(), names.get(t.id.as_str()).cloned())),
    );
    if let Err(e) = targets::save_known_targets(docs, &known) {
        rt.bus.warn(None, format!("known-target list save failed: {e}"));
    }

    let today = Local::now().format("%Y-%m-%d").to_string();

    // date → [(target id, that day's sections)], oldest date first.
    let mut by_date: BTreeMap<String, Vec<(String, Vec<Section>)>> = BTreeMap::new();
    for target in &known {
        let content = docs.read_group_buffer(&target.id);
        if content.is_empty() {
            continue;
        }
        for (date, sections) in group_buffer::sections_by_date(&content) {
            if date == today {
                continue;
            }
            by_date
                .entry(date)
                .or_default()
                .push((target.id.clone(), sections));
        }
    }

    let mut written = 0;
    for (date, entries) in &by_date {
        if !rt.live() {
            return written;
        }
        let prompt = digest_prompt(date, entries, &names);
        let request = ChatRequest {
            model: config.model.clone(),
            system: DIGEST_SYSTEM_PROMPT.to_string(),
            history: vec![HistoryItem::Turn(Turn::user(prompt))],
            tools: Vec::new(),
            max_tokens: DIGEST_MAX_TOKENS,
            temperature: Some(DIGEST_TEMPERATURE),
        };

        let digest = match rt.deps.backend.send(&request).await {
            Ok(resp) if !resp.content.trim().is_empty() => resp.content.trim().to_string(),
            Ok(_) => {
                rt.bus
                    .warn(None, format!("empty digest for {date}, keeping source sections"));
                continue;
            }
            Err(e) => {
                // The sections survive; the next run retries this date.
                rt.bus
                    .warn(None, format!("daily digest for {date} failed: {e}"));
                continue;
            }
        };

        if !rt.live() {
            return written;
        }
        if let Err(e) = docs.write_daily_digest(date, &digest) {
            rt.bus
                .warn(None, format!("digest write for {date} failed: {e}"));
            continue;
        }

        // Only after the digest is safely on disk, delete exactly this
        // date's sections from each affected archive.
        for (target_id, _) in entries {
            let content = docs.read_group_buffer(target_id);
            let rewritten = group_buffer::remove_date(&content, date);
            if let Err(e) = docs.write_group_buffer(target_id, &rewritten) {
                rt.bus.warn(
                    Some(target_id.as_str()),
                    format!("archive rewrite after digest failed: {e}"),
                );
            }
        }

        rt.bus.log(
            LogLevel::Memory,
            None,
            format!("daily digest written for {date}"),
            None,
        );
        written += 1;
    }

    let meta_record = meta::CompressMeta {
        last_compress_time: Some(chrono::Utc::now().to_rfc3339()),
    };
    if let Err(e) = meta::save_compress_meta(docs, &meta_record) {
        rt.bus.warn(None, format!("compress metadata save failed: {e}"));
    }

    written
}

fn digest_prompt(
    date: &str,
    entries: &[(String, Vec<Section>)],
    names: &std::collections::HashMap<String, String>,
) -> String {
    let mut out = format!("以下是 {date} 当天各聊天室的摘要片段：\n");
    for (target_id, sections) in entries {
        let label = names
            .get(target_id)
            .map(|n| format!("{n}（{target_id}）"))
            .unwrap_or_else(|| target_id.clone());
        out.push_str(&format!("\n# 聊天室 {label}\n"));
        for section in sections {
            out.push_str(&format!("- [{}] {}\n", section.timestamp, section.body));
        }
    }
    out.push_str("\n请写出这一天的总结。");
    out
}

/// Time until the next local 23:55, today if still ahead, else tomorrow.
pub fn duration_until_next_run(now: DateTime<Local>) -> Duration {
    let Some(today_run) = now.date_naive().and_hms_opt(23, 55, 0) else {
        return Duration::from_secs(3600);
    };
    let next = if now.naive_local() < today_run {
        today_run
    } else {
        today_run + chrono::Duration::days(1)
    };
    (next - now.naive_local())
        .to_std()
        .unwrap_or(Duration::from_secs(60))
}
