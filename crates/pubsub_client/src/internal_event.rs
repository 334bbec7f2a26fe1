use std::time::Duration;

use metrics::{counter, histogram};

use crate::client::Operation;

pub(crate) struct RequestCompleted<'a> {
    pub(crate) operation: Operation,
    pub(crate) project_name: &'a str,
    pub(crate) succeeded: bool,
    pub(crate) latency: Duration,
}

impl RequestCompleted<'_> {
    pub(crate) fn emit(self) {
        let result = if self.succeeded { "success" } else { "failure" };
        histogram!(
            "pubsub_client_request_latency_seconds",
            "operation" => self.operation.as_str(),
            "project_name" => self.project_name.to_owned(),
            "result" => result,
        )
        .record(self.latency.as_secs_f64());
        trace!(
            target: "pubsub_client::stats",
            operation = self.operation.as_str(),
            project_name = self.project_name,
            result,
            latency_ms = self.latency.as_millis(),
            "Request Completed"
        );
    }
}

pub(crate) struct MessagesTransferred<'a> {
    pub(crate) operation: Operation,
    pub(crate) project_name: &'a str,
    pub(crate) count: usize,
}

impl MessagesTransferred<'_> {
    pub(crate) fn emit(self) {
        counter!(
            "pubsub_client_request_messages_total",
            "operation" => self.operation.as_str(),
            "project_name" => self.project_name.to_owned(),
            "result" => "success",
        )
        .increment(self.count as u64);
    }
}
