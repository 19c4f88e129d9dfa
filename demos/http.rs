use std::time::Duration;

use loadstage::{
    http::Request, metric::MetricKind, Reporter, RunConfig, Runner, Scenario, Stage,
    StdoutReporter, Vu,
};
use serde_json::json;

#[tokio::main]
async fn main() -> loadstage::Result<()> {
    tracing_subscriber::fmt().with_writer(std::io::stderr).init();

    let config = RunConfig::new(vec![
        // Start with a ramp up from 0 to 10 over 3 seconds
        Stage::new(Duration::from_secs(3), 10),
        // Hold 10 VUs for 5 seconds
        Stage::new(Duration::from_secs(5), 10),
        // ramp down to nothing
        Stage::new(Duration::from_secs(3), 0),
    ])
    // Yeah lets hardcode it
    .with_base_url("http://localhost:3000")
    .with_threshold("http_req_duration", &["p(95)<500"])
    .with_threshold("create_todo", &["avg<200"])
    .with_threshold("http_req_failed", &["rate<0.05"]);

    let scenario = Scenario::builder()
        .name("todos")
        .metrics(vec![("create_todo".to_string(), MetricKind::Trend)])
        .action(|vu: Vu| async move {
            vu.group("create", async {
                let title = format!("todo-{}", vu.data().alphanumeric(6));
                let res = vu
                    .send(&Request::post("create_todo", "/todos").json(json!({ "title": title })))
                    .await;
                vu.check(&res, "has id", |r| r.json("id").is_some());
                if let Some(id) = res.json("id").and_then(|id| id.as_str()) {
                    vu.pool().push(id.to_owned());
                }
            })
            .await;

            // Read back somebody's todo
            if let Some(id) = vu.pool().random(vu.data()) {
                let res = vu.send(&Request::get("get_todo", format!("/todos/{id}"))).await;
                vu.check(&res, "status is 200", |r| r.status == Some(200));
            }

            vu.think(Duration::from_millis(200), Duration::from_secs(1)).await;
        })
        .build();

    let runner = Runner::new(config);
    let cancel = runner.cancel_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            cancel.cancel();
        }
    });

    let report = runner.run(scenario).await?;
    StdoutReporter.report(&report).await?;
    Ok(())
}
