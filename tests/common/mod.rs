#![allow(dead_code)]

use std::path::Path;

use rsdl::{plan, JobEvent, JobHandle, JobRequest, JobState};
use url::Url;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

pub const AUTH_ALICE: &str = "Basic YWxpY2U6c2VjcmV0";

/// Deterministic non-repeating-looking payload.
pub fn body(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 % 251) as u8).collect()
}

pub fn head_response(len: usize, ranges: bool) -> ResponseTemplate {
    let mut response = ResponseTemplate::new(200)
        .insert_header("content-length", len.to_string().as_str())
        .set_body_bytes(vec![0u8; len]);
    if ranges {
        response = response.insert_header("accept-ranges", "bytes");
    }
    response
}

pub async fn mount_head(server: &MockServer, p: &str, len: usize, ranges: bool) {
    Mock::given(method("HEAD"))
        .and(path(p))
        .respond_with(head_response(len, ranges))
        .mount(server)
        .await;
}

/// One `206` mock per planned range, optionally requiring an Authorization header.
pub async fn mount_segments(server: &MockServer, p: &str, content: &[u8], workers: usize, auth: Option<&str>) {
    for range in plan(content.len() as u64, workers) {
        let mut mock = Mock::given(method("GET"))
            .and(path(p))
            .and(header("range", range.header_value().as_str()));
        if let Some(value) = auth {
            mock = mock.and(header("authorization", value));
        }
        let slice = content[range.start as usize..=range.end as usize].to_vec();
        mock.respond_with(ResponseTemplate::new(206).set_body_bytes(slice))
            .mount(server)
            .await;
    }
}

pub async fn mount_resource(server: &MockServer, p: &str, content: &[u8], workers: usize) {
    mount_head(server, p, content.len(), true).await;
    mount_segments(server, p, content, workers, None).await;
}

pub fn request(server: &MockServer, p: &str, dir: &Path, workers: usize) -> JobRequest {
    let url = Url::parse(&format!("{}{}", server.uri(), p)).unwrap();
    JobRequest::new(url, dir.join("file.bin")).with_workers(workers)
}

/// Reads every event until the job ends.
pub async fn collect(job: &mut JobHandle) -> Vec<JobEvent> {
    let mut events = Vec::new();
    while let Some(event) = job.next_event().await {
        events.push(event);
    }
    events
}

pub async fn run(job: JobHandle) -> (Vec<JobEvent>, JobState) {
    let mut job = job;
    let events = collect(&mut job).await;
    (events, job.wait().await)
}

pub fn progress(events: &[JobEvent]) -> Vec<u64> {
    events
        .iter()
        .filter_map(|e| match e {
            JobEvent::Progress { bytes_done, .. } => Some(*bytes_done),
            _ => None,
        })
        .collect()
}

/// File names left in `dir`, sorted.
pub fn files_in(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    names
}
