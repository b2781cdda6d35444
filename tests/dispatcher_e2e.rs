mod util;

use std::io::Cursor;
use std::time::Duration;

use ai_engine::server::{Dispatcher, ErrorCode, Outbound};
use crossbeam_channel::Receiver;
use serde_json::{Value, json};

/// Run `lines` through the serve loop and return every response, in order.
fn serve_lines(dispatcher: &Dispatcher, rx: &Receiver<Outbound>, lines: &[&str]) -> Vec<Value> {
    let input = lines.join("\n");
    dispatcher.serve(Cursor::new(input.into_bytes())).unwrap();
    rx.try_iter()
        .filter_map(|out| match out {
            Outbound::Response(response) => Some(serde_json::to_value(response).unwrap()),
            _ => None,
        })
        .collect()
}

fn next_event(rx: &Receiver<Outbound>) -> Value {
    loop {
        match rx.recv_timeout(Duration::from_secs(5)).expect("event") {
            Outbound::Event(event) => return serde_json::to_value(event).unwrap(),
            _ => continue,
        }
    }
}

#[test]
fn bad_lines_get_errors_and_the_loop_keeps_going() {
    let (dispatcher, rx, _tmp) = util::engine();
    let responses = serve_lines(
        &dispatcher,
        &rx,
        &[
            "this is not json",
            r#"{"id":1}"#,
            "",
            r#"{"id":2,"method":"does.not.exist"}"#,
            r#"{"id":3,"method":"jobs.status","params":{"jobId":42}}"#,
            r#"{"id":4,"method":"engine.health"}"#,
        ],
    );

    assert_eq!(responses.len(), 5, "blank lines get no response");
    assert_eq!(responses[0]["error"]["code"], ErrorCode::PARSE_ERROR);
    assert!(responses[0]["id"].is_null());
    assert_eq!(responses[1]["error"]["code"], ErrorCode::INVALID_REQUEST);
    assert_eq!(responses[1]["id"], 1);
    assert_eq!(responses[2]["error"]["code"], ErrorCode::METHOD_NOT_FOUND);
    assert_eq!(responses[3]["error"]["code"], ErrorCode::INVALID_PARAMS);
    assert_eq!(responses[4]["result"]["status"], "ok");
    assert!(responses.iter().all(|r| r["jsonrpc"] == "2.0"));
}

#[test]
fn unknown_job_type_is_rejected_without_a_record() {
    let (dispatcher, _rx, _tmp) = util::engine();
    let resp = util::call(&dispatcher, 1, "jobs.start", json!({"type": "ocr.extract"}));
    assert_eq!(resp["error"]["code"], ErrorCode::INVALID_PARAMS);
    assert_eq!(resp["error"]["message"], "Unknown job type: ocr.extract");
    assert_eq!(resp["error"]["data"]["jobType"], "ocr.extract");

    let list = util::call(&dispatcher, 2, "jobs.list", Value::Null);
    assert_eq!(list["result"], json!([]));
}

#[test]
fn job_lifecycle_over_the_wire() {
    let (dispatcher, rx, _tmp) = util::engine();

    let types = util::call(&dispatcher, 1, "jobs.types", Value::Null);
    assert_eq!(
        types["result"],
        json!(["engine.echo", "engine.sleep", "engine.warmup"])
    );

    let start = util::call(
        &dispatcher,
        2,
        "jobs.start",
        json!({"type": "engine.sleep", "payload": {"steps": 2, "intervalMs": 10}, "priority": "high"}),
    );
    let job_id = start["result"]["jobId"].as_str().unwrap().to_string();

    let first = next_event(&rx);
    assert_eq!(first["type"], "progress");
    assert_eq!(first["jobId"], job_id.as_str());
    assert_eq!(first["data"]["percent"], 50.0);
    assert_eq!(first["data"]["message"], "step 1/2");
    assert_eq!(next_event(&rx)["data"]["percent"], 100.0);

    let result = next_event(&rx);
    assert_eq!(result["type"], "result");
    assert_eq!(result["data"], json!({"steps": 2}));

    let status = util::call(&dispatcher, 3, "jobs.status", json!({"jobId": job_id}));
    assert_eq!(status["result"]["state"], "done");
    assert_eq!(status["result"]["progress"], 100.0);
    assert!(status["result"]["completedAt"].is_i64());

    let fetched = util::call(&dispatcher, 4, "jobs.result", json!({"jobId": job_id}));
    assert_eq!(fetched["result"], json!({"success": true, "data": {"steps": 2}}));

    let cancel = util::call(&dispatcher, 5, "jobs.cancel", json!({"jobId": job_id}));
    assert_eq!(
        cancel["result"],
        json!({"success": false, "reason": "Job already done"})
    );

    let list = util::call(&dispatcher, 6, "jobs.list", Value::Null);
    assert_eq!(list["result"][0]["jobId"], job_id.as_str());
    assert_eq!(list["result"][0]["type"], "engine.sleep");

    let missing = util::call(&dispatcher, 7, "jobs.cancel", json!({"jobId": "nope"}));
    assert_eq!(missing["error"]["code"], ErrorCode::JOB_NOT_FOUND);
}

#[test]
fn failed_job_reports_error_event_and_result() {
    let (dispatcher, rx, _tmp) = util::engine();
    let start = util::call(
        &dispatcher,
        1,
        "jobs.start",
        json!({"type": "engine.sleep", "payload": {"steps": "many"}}),
    );
    let job_id = start["result"]["jobId"].as_str().unwrap().to_string();

    let event = next_event(&rx);
    assert_eq!(event["type"], "error");
    assert!(event["data"].as_str().unwrap().starts_with("invalid payload"));

    let fetched = util::call(&dispatcher, 2, "jobs.result", json!({"jobId": job_id}));
    assert_eq!(fetched["result"]["success"], false);
    assert!(fetched["result"].get("data").is_none());
}

#[test]
fn cache_methods_round_trip() {
    let (dispatcher, _rx, _tmp) = util::engine();

    let set = util::call(
        &dispatcher,
        1,
        "cache.set",
        json!({"key": "ocr:page1", "value": {"text": "hello"}, "ttl": 0}),
    );
    assert_eq!(set["result"]["success"], true);
    util::call(&dispatcher, 2, "cache.set", json!({"key": "ocr:page2", "value": 2}));
    util::call(&dispatcher, 3, "cache.set", json!({"key": "emb:doc", "value": [1, 2]}));

    let got = util::call(&dispatcher, 4, "cache.get", json!({"key": "ocr:page1"}));
    assert_eq!(got["result"]["found"], true);
    assert_eq!(got["result"]["value"], json!({"text": "hello"}));
    assert!(got["result"]["expiresAt"].is_null());

    let stats = util::call(&dispatcher, 5, "cache.stats", Value::Null);
    assert_eq!(stats["result"]["entries"], 3);

    let deleted = util::call(&dispatcher, 6, "cache.delete", json!({"key": "emb:doc"}));
    assert_eq!(deleted["result"], json!({"success": true, "existed": true}));
    let deleted = util::call(&dispatcher, 7, "cache.delete", json!({"key": "emb:doc"}));
    assert_eq!(deleted["result"]["existed"], false);

    let cleared = util::call(&dispatcher, 8, "cache.clear", json!({"prefix": "ocr:"}));
    assert_eq!(cleared["result"], json!({"success": true, "cleared": 2}));

    let miss = util::call(&dispatcher, 9, "cache.get", json!({"key": "ocr:page1"}));
    assert_eq!(miss["result"], json!({"found": false}));

    let pruned = util::call(&dispatcher, 10, "cache.prune", Value::Null);
    assert_eq!(pruned["result"]["pruned"], 0);
}

#[test]
fn model_methods_and_aliases() {
    let (dispatcher, _rx, _tmp) = util::engine();

    let list = util::call(&dispatcher, 1, "models.list", Value::Null);
    let models = list["result"].as_array().unwrap();
    assert_eq!(models.len(), 9);
    assert!(models.iter().all(|m| m["loaded"] == false));
    let whisper = models.iter().find(|m| m["id"] == "whisper-base").unwrap();
    assert_eq!(whisper["type"], "whisper");
    assert_eq!(whisper["size"], 150_000_000u64);

    let load = util::call(&dispatcher, 2, "resources.load", json!({"modelId": "whisper-base"}));
    assert_eq!(load["result"]["success"], true);
    assert!(load["result"]["loadTime"].is_u64());

    let status = util::call(&dispatcher, 3, "models.status", json!({"modelId": "whisper-base"}));
    assert_eq!(status["result"]["loaded"], true);
    assert_eq!(status["result"]["memoryUsage"], 300_000_000u64);
    assert!(status["result"]["lastUsed"].is_i64());

    let health = util::call(&dispatcher, 4, "engine.health", Value::Null);
    assert_eq!(health["result"]["budget"]["used"], 300_000_000u64);

    let unload = util::call(&dispatcher, 5, "models.unload", json!({"modelId": "whisper-base"}));
    assert_eq!(unload["result"]["success"], true);
    let unknown = util::call(&dispatcher, 6, "models.unload", json!({"modelId": "nope"}));
    assert_eq!(unknown["result"]["success"], false);

    let health = util::call(&dispatcher, 7, "engine.health", Value::Null);
    assert_eq!(health["result"]["budget"]["used"], 0);
}

#[test]
fn shutdown_request_stops_reading_and_releases_resources() {
    let (dispatcher, rx, _tmp) = util::engine();
    let responses = serve_lines(
        &dispatcher,
        &rx,
        &[
            r#"{"id":1,"method":"models.load","params":{"modelId":"easyocr-en"}}"#,
            r#"{"id":2,"method":"engine.shutdown"}"#,
            r#"{"id":3,"method":"engine.health"}"#,
        ],
    );
    assert_eq!(responses.len(), 2, "lines after shutdown are not read");
    assert_eq!(responses[1]["result"]["success"], true);

    dispatcher.shutdown();
    assert_eq!(dispatcher.resources().budget().used, 0);
    let resp = util::call(&dispatcher, 4, "jobs.start", json!({"type": "engine.echo"}));
    assert_eq!(resp["error"]["code"], ErrorCode::INTERNAL_ERROR);
}
