// gateway_server/src/ssh/output.rs

//! PTY 输出的行累积器与批量下发判定。
//!
//! 终端程序使用裸回车 `\r` 原地重写当前行（典型如进度条），只有换行 `\n`
//! 才把一行"提交"为最终输出。若把每个 `\r` 终止的片段都当作一行转发，
//! 会产生输出风暴，并可能让终止短语在一个随后被覆盖的进度片段上误判命中。
//!
//! [`PtyOutputBuffer`] 因此维护两个区域：
//! - `committed`: 已由 `\n` 提交、尚未下发的整行输出；
//! - `partial`: 当前逻辑行。收到裸 `\r` 后，下一个字符开始覆盖该行
//!   （`\r\n` 序列视为普通的行提交）。
//!
//! 终止短语的扫描范围是"已提交输出 + 当前逻辑行"；一个已被 `\r` 终止、
//! 等待覆盖的片段不参与扫描。跨下发批次的命中通过保留已下发文本的尾巴
//! (`scan_tail`) 实现。

/// 行累积器。一次交互式命令 / 一次 SCP 传输各持有一个实例。
pub struct PtyOutputBuffer {
    stop_phrase: String,
    /// 已提交、尚未被 `drain_committed` 取走的输出。
    committed: String,
    /// 当前逻辑行（可能被后续的 `\r` 覆盖）。
    partial: String,
    /// 上一个字符是裸 `\r`：下一个字符决定是覆盖 (非 `\n`) 还是提交 (`\n`)。
    pending_cr: bool,
    /// 已下发文本的尾巴，长度不超过终止短语长度减一，用于跨批次命中。
    scan_tail: String,
    /// 终止短语是否已经命中。命中后保持为真。
    stop_seen: bool,
    /// 最近一次作为进度快照下发过的逻辑行内容。
    last_progress: String,
}

impl PtyOutputBuffer {
    pub fn new(stop_phrase: &str) -> Self {
        Self {
            stop_phrase: stop_phrase.to_string(),
            committed: String::new(),
            partial: String::new(),
            pending_cr: false,
            scan_tail: String::new(),
            stop_seen: false,
            last_progress: String::new(),
        }
    }

    /// 吸收一段（已经过 UTF-8 有损解码的）原始 PTY 输出。
    pub fn push_chunk(&mut self, chunk: &str) {
        for ch in chunk.chars() {
            if self.pending_cr {
                self.pending_cr = false;
                if ch == '\n' {
                    // `\r\n` 序列：普通的行提交
                    self.commit_line();
                    continue;
                }
                // 裸 `\r`：当前逻辑行被覆盖
                self.partial.clear();
            }
            match ch {
                '\n' => self.commit_line(),
                '\r' => self.pending_cr = true,
                _ => self.partial.push(ch),
            }
        }
        self.rescan_stop_phrase();
    }

    fn commit_line(&mut self) {
        self.committed.push_str(&self.partial);
        self.committed.push('\n');
        self.partial.clear();
    }

    /// 在"已提交输出 + 当前逻辑行"上扫描终止短语。
    ///
    /// `pending_cr` 为真时当前逻辑行已被 `\r` 终止、只是尚未被覆盖，
    /// 这样的进度片段不参与扫描；若其后跟来的是 `\n`（即 `\r\n` 提交），
    /// 该行会进入 `committed` 并在下一次扫描时命中。
    fn rescan_stop_phrase(&mut self) {
        if self.stop_seen || self.stop_phrase.is_empty() {
            return;
        }
        let mut haystack =
            String::with_capacity(self.scan_tail.len() + self.committed.len() + self.partial.len());
        haystack.push_str(&self.scan_tail);
        haystack.push_str(&self.committed);
        if !self.pending_cr {
            haystack.push_str(&self.partial);
        }
        if haystack.contains(&self.stop_phrase) {
            self.stop_seen = true;
        }
    }

    /// 终止短语是否已在已提交输出或当前逻辑行中出现。
    pub fn stop_phrase_seen(&self) -> bool {
        self.stop_seen
    }

    /// 当前可下发（已提交）内容的字节数，用于容量触发的提前下发判定。
    pub fn committed_len(&self) -> usize {
        self.committed.len()
    }

    /// 取走全部已提交输出。当前逻辑行保留在缓冲内。
    pub fn drain_committed(&mut self) -> String {
        let drained = std::mem::take(&mut self.committed);
        self.absorb_into_tail(&drained);
        drained
    }

    /// 取走全部缓冲内容（已提交输出 + 当前逻辑行），用于终止前的最后一次下发。
    pub fn drain_all(&mut self) -> String {
        let mut drained = std::mem::take(&mut self.committed);
        drained.push_str(&self.partial);
        self.partial.clear();
        self.pending_cr = false;
        self.absorb_into_tail(&drained);
        drained
    }

    /// 把已下发文本并入扫描尾巴，只保留可能与后续内容拼出终止短语的长度。
    fn absorb_into_tail(&mut self, drained: &str) {
        let keep = self.stop_phrase.chars().count().saturating_sub(1);
        if keep == 0 {
            return;
        }
        self.scan_tail.push_str(drained);
        let total = self.scan_tail.chars().count();
        if total > keep {
            let cut = self
                .scan_tail
                .char_indices()
                .nth(total - keep)
                .map(|(idx, _)| idx)
                .unwrap_or(0);
            self.scan_tail.drain(..cut);
        }
    }

    /// 当前逻辑行的只读视图（SCP 流程用它识别密码提示符）。
    pub fn current_line(&self) -> &str {
        &self.partial
    }

    /// 丢弃当前逻辑行（例如已应答的密码提示符，不应转发给客户端）。
    pub fn clear_current_line(&mut self) {
        self.partial.clear();
        self.pending_cr = false;
    }

    /// 返回当前逻辑行的进度快照（仅当内容自上次快照后发生变化）。
    ///
    /// SCP 等工具的进度输出完全由 `\r` 重写构成，永远不会进入 `committed`；
    /// 周期性下发批次为空时可用该快照向客户端报告进度。
    pub fn progress_snapshot(&mut self) -> Option<String> {
        if self.partial.is_empty() || self.partial == self.last_progress {
            return None;
        }
        self.last_progress = self.partial.clone();
        Some(self.partial.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_newline_commits_lines() {
        let mut buffer = PtyOutputBuffer::new("PROMPT>");
        buffer.push_chunk("line one\nline two\npart");
        assert_eq!(buffer.drain_committed(), "line one\nline two\n");
        // 未完成的逻辑行保留
        assert_eq!(buffer.drain_all(), "part");
    }

    #[test]
    fn test_bare_cr_overwrites_current_line() {
        let mut buffer = PtyOutputBuffer::new("PROMPT>");
        buffer.push_chunk("progress 10%\rprogress 50%\rprogress 100%\ndone\n");
        // 被 \r 覆盖的片段不应出现在提交输出中
        assert_eq!(buffer.drain_committed(), "progress 100%\ndone\n");
    }

    #[test]
    fn test_crlf_is_a_plain_line_commit() {
        let mut buffer = PtyOutputBuffer::new("PROMPT>");
        buffer.push_chunk("alpha\r\nbeta\r\n");
        assert_eq!(buffer.drain_committed(), "alpha\nbeta\n");
    }

    #[test]
    fn test_stop_phrase_in_overwritten_segment_does_not_trigger() {
        let mut buffer = PtyOutputBuffer::new("DATA_READY");
        // 终止短语只出现在一个被 \r 终止并随后覆盖的进度片段中
        buffer.push_chunk("loading DATA_READY 10%\r");
        assert!(!buffer.stop_phrase_seen(), "\\r 终止的片段不应触发终止短语");
        buffer.push_chunk("loading 99%\r");
        assert!(!buffer.stop_phrase_seen());
        buffer.push_chunk("finished\n");
        assert!(!buffer.stop_phrase_seen());
    }

    #[test]
    fn test_stop_phrase_in_committed_line_triggers() {
        let mut buffer = PtyOutputBuffer::new("DATA_READY");
        buffer.push_chunk("step one\nDATA_READY\r\n");
        assert!(buffer.stop_phrase_seen());
    }

    #[test]
    fn test_stop_phrase_in_partial_prompt_triggers() {
        // 提示符通常不带换行，终止短语必须能在当前逻辑行上命中
        let mut buffer = PtyOutputBuffer::new("PROMPT>");
        buffer.push_chunk("output line\nPROMPT>");
        assert!(buffer.stop_phrase_seen());
    }

    #[test]
    fn test_stop_phrase_split_across_read_slices() {
        let mut buffer = PtyOutputBuffer::new("DATA_READY");
        buffer.push_chunk("xxDATA_");
        assert!(!buffer.stop_phrase_seen());
        // 短语的后半部分在下一个读片中到达，且期间发生过一次批量下发
        let _ = buffer.drain_committed();
        buffer.push_chunk("READY");
        assert!(buffer.stop_phrase_seen());
    }

    #[test]
    fn test_oversized_chunk_drains_exactly_once() {
        let flush_bytes = 4096usize;
        let mut buffer = PtyOutputBuffer::new("PROMPT>");
        let big_line = "x".repeat(1000);
        let mut chunk = String::new();
        for _ in 0..8 {
            chunk.push_str(&big_line);
            chunk.push('\n');
        }
        buffer.push_chunk(&chunk);
        assert!(buffer.committed_len() > flush_bytes);
        let first = buffer.drain_committed();
        assert_eq!(first.len(), 8 * 1001);
        // 再次取用必须为空：单个超大读片只触发一次下发
        assert!(buffer.drain_committed().is_empty());
    }

    #[test]
    fn test_empty_stop_phrase_never_matches() {
        let mut buffer = PtyOutputBuffer::new("");
        buffer.push_chunk("anything at all\n");
        assert!(!buffer.stop_phrase_seen());
    }

    #[test]
    fn test_progress_snapshot_deduplicates() {
        let mut buffer = PtyOutputBuffer::new("DONE");
        buffer.push_chunk("file.dat  10% 1.2MB/s\r");
        // pending_cr 状态下 partial 已被标记为进度片段，但快照仍反映其内容
        buffer.push_chunk("file.dat  55% 1.3MB/s\r");
        buffer.push_chunk("file.dat  55% 1.3MB/s");
        let first = buffer.progress_snapshot();
        assert_eq!(first.as_deref(), Some("file.dat  55% 1.3MB/s"));
        // 内容未变化时不重复上报
        assert!(buffer.progress_snapshot().is_none());
    }
}
