use chrono::{DateTime, Utc};
use hodei_common::model::{
    Execution, ExecutionEvent, ExecutionId, ExecutionStatus, JobId, LogChunk, WorkerId,
};
use std::collections::{HashMap, VecDeque};
use tracing::trace;

/// In-memory aggregate of one execution: the entity itself plus the events
/// and log chunks observed so far. Owned by the engine alone.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub execution: Execution,
    pub events: Vec<ExecutionEvent>,
    pub logs: VecDeque<LogChunk>,
    log_bytes: usize,
    max_log_bytes: usize,
}

impl ExecutionContext {
    pub fn new(execution: Execution, max_log_bytes: usize) -> Self {
        Self {
            execution,
            events: Vec::new(),
            logs: VecDeque::new(),
            log_bytes: 0,
            max_log_bytes,
        }
    }

    pub fn append_event(&mut self, event: ExecutionEvent) {
        self.events.push(event);
    }

    /// Appends a chunk, evicting the oldest ones when the buffer cap is
    /// exceeded. Live subscribers are the only way to observe full logs.
    pub fn append_log(&mut self, chunk: LogChunk) {
        self.log_bytes += chunk.payload.len();
        self.logs.push_back(chunk);
        while self.log_bytes > self.max_log_bytes {
            match self.logs.pop_front() {
                Some(evicted) => {
                    self.log_bytes -= evicted.payload.len();
                    trace!(
                        execution_id = %self.execution.id,
                        evicted_bytes = evicted.payload.len(),
                        "log buffer cap reached, oldest chunk evicted"
                    );
                }
                None => break,
            }
        }
    }

    pub fn log_bytes(&self) -> usize {
        self.log_bytes
    }

    pub fn summary(&self) -> ExecutionContextSummary {
        ExecutionContextSummary {
            execution_id: self.execution.id.clone(),
            job_id: self.execution.job_id.clone(),
            worker_id: self.execution.worker_id.clone(),
            status: self.execution.status,
            started_at: self.execution.started_at,
            event_count: self.events.len(),
            log_bytes: self.log_bytes,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionContextSummary {
    pub execution_id: ExecutionId,
    pub job_id: JobId,
    pub worker_id: Option<WorkerId>,
    pub status: ExecutionStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub event_count: usize,
    pub log_bytes: usize,
}

/// Keeps active contexts plus a bounded tail of terminal ones for
/// inspection.
pub struct ContextStore {
    contexts: HashMap<ExecutionId, ExecutionContext>,
    terminal_order: VecDeque<ExecutionId>,
    max_terminal: usize,
}

impl ContextStore {
    pub fn new(max_terminal: usize) -> Self {
        Self {
            contexts: HashMap::new(),
            terminal_order: VecDeque::new(),
            max_terminal,
        }
    }

    pub fn insert(&mut self, context: ExecutionContext) {
        self.contexts.insert(context.execution.id.clone(), context);
    }

    pub fn get(&self, execution_id: &ExecutionId) -> Option<&ExecutionContext> {
        self.contexts.get(execution_id)
    }

    pub fn get_mut(&mut self, execution_id: &ExecutionId) -> Option<&mut ExecutionContext> {
        self.contexts.get_mut(execution_id)
    }

    pub fn remove(&mut self, execution_id: &ExecutionId) -> Option<ExecutionContext> {
        self.contexts.remove(execution_id)
    }

    /// Marks a context terminal, evicting the oldest terminal context once
    /// the retention cap is reached.
    pub fn mark_terminal(&mut self, execution_id: &ExecutionId) {
        if !self.contexts.contains_key(execution_id) {
            return;
        }
        self.terminal_order.push_back(execution_id.clone());
        while self.terminal_order.len() > self.max_terminal {
            if let Some(evicted) = self.terminal_order.pop_front() {
                self.contexts.remove(&evicted);
            }
        }
    }

    pub fn active_summaries(&self) -> Vec<ExecutionContextSummary> {
        let mut summaries: Vec<ExecutionContextSummary> = self
            .contexts
            .values()
            .filter(|context| !context.execution.status.is_terminal())
            .map(ExecutionContext::summary)
            .collect();
        summaries.sort_by(|a, b| a.execution_id.cmp(&b.execution_id));
        summaries
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use hodei_common::model::LogStream;
    use test_r::test;

    fn chunk(execution_id: &ExecutionId, payload: &str) -> LogChunk {
        LogChunk {
            execution_id: execution_id.clone(),
            stream: LogStream::Stdout,
            payload: Bytes::from(payload.to_string()),
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn log_buffer_evicts_oldest_chunks() {
        let execution = Execution::new(JobId::generate());
        let execution_id = execution.id.clone();
        let mut context = ExecutionContext::new(execution, 10);

        context.append_log(chunk(&execution_id, "aaaa"));
        context.append_log(chunk(&execution_id, "bbbb"));
        context.append_log(chunk(&execution_id, "cccc"));

        assert!(context.log_bytes() <= 10);
        let remaining: Vec<&LogChunk> = context.logs.iter().collect();
        assert_eq!(remaining.len(), 2);
        assert_eq!(remaining[0].payload, Bytes::from("bbbb"));
    }

    #[test]
    fn terminal_contexts_are_evicted_beyond_the_cap() {
        let mut store = ContextStore::new(1);
        let first = Execution::new(JobId::generate());
        let first_id = first.id.clone();
        let second = Execution::new(JobId::generate());
        let second_id = second.id.clone();

        store.insert(ExecutionContext::new(first, 100));
        store.insert(ExecutionContext::new(second, 100));
        store.mark_terminal(&first_id);
        store.mark_terminal(&second_id);

        assert!(store.get(&first_id).is_none());
        assert!(store.get(&second_id).is_some());
    }
}
