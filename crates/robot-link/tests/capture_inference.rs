mod support;

use std::io::Cursor;

use robot_link::protocol::ChannelMode;
use robot_link::{
    CaptureStatus, ConnectionStatus, LinkConfig, LinkError, RobotLink, SessionEvent,
};
use tokio::sync::broadcast;
use tokio::time::timeout;

use support::mock_robot::{MockRobotServer, STEP_TIMEOUT};

async fn start_server_or_skip(test_name: &str) -> Option<MockRobotServer> {
    match MockRobotServer::start().await {
        Ok(server) => Some(server),
        Err(err) => {
            eprintln!("Skipping {test_name}: unable to start mock server: {err}");
            None
        }
    }
}

fn test_config(server: &MockRobotServer, inference_url: String) -> LinkConfig {
    let mut config = LinkConfig::new(server.http_url());
    config.thermal.enabled = false;
    config.inference.url = Some(inference_url);
    config.inference.timeout_secs = 5;
    config
}

fn png_frame() -> Vec<u8> {
    let img = image::RgbImage::from_pixel(8, 8, image::Rgb([90, 140, 30]));
    let mut out = Cursor::new(Vec::new());
    image::DynamicImage::ImageRgb8(img)
        .write_to(&mut out, image::ImageFormat::Png)
        .unwrap();
    out.into_inner()
}

async fn wait_live(events: &mut broadcast::Receiver<SessionEvent>) {
    timeout(STEP_TIMEOUT, async {
        loop {
            if let Ok(SessionEvent::StatusChanged {
                status: ConnectionStatus::Live,
                ..
            }) = events.recv().await
            {
                return;
            }
        }
    })
    .await
    .expect("session never went live");
}

fn capture_statuses(events: &mut broadcast::Receiver<SessionEvent>) -> Vec<CaptureStatus> {
    let mut out = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let SessionEvent::Capture(status) = event {
            out.push(status);
        }
    }
    out
}

#[tokio::test]
async fn capture_uploads_last_socket_payload() {
    let Some(mut server) = start_server_or_skip("capture_uploads_last_socket_payload").await
    else {
        return;
    };
    let mut inference = mockito::Server::new_async().await;
    let mock = inference
        .mock("POST", "/predict")
        .match_header(
            "content-type",
            mockito::Matcher::Regex("multipart/form-data; boundary=".into()),
        )
        .match_body(mockito::Matcher::AllOf(vec![
            mockito::Matcher::Regex(r#"name="image""#.into()),
            mockito::Matcher::Regex("second-frame".into()),
        ]))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"prediction":"leaf_spot","score":0.42,"all_confidences":{"leaf_spot":0.42,"healthy":0.58}}"#)
        .expect(1)
        .create_async()
        .await;

    let mut config = test_config(&server, format!("{}/predict", inference.url()));
    config.inference.image_field = "image".into();
    let link = RobotLink::start(config).unwrap();
    let mut events = link.event_receiver();
    link.connect("r1").await.unwrap();

    let mut channels = server.accept_many(2).await;
    let video = channels.take("/ws/video");
    video.send_frame(b"first-frame").await;
    video.send_frame(b"second-frame").await;
    wait_live(&mut events).await;

    let prediction = link.capture().await.unwrap();
    assert_eq!(prediction.label_text(), "leaf_spot");
    assert_eq!(prediction.confidence_text(), "42%");
    assert_eq!(
        prediction.distribution_text(),
        "healthy(58.00%), leaf_spot(42.00%)"
    );
    mock.assert_async().await;

    assert_eq!(
        capture_statuses(&mut events),
        vec![
            CaptureStatus::CapturingFrame,
            CaptureStatus::Submitting,
            CaptureStatus::AwaitingResult,
            CaptureStatus::Complete,
        ]
    );
    let last = link.last_capture().unwrap();
    assert_eq!(last.status, CaptureStatus::Complete);
    assert_eq!(last.result, Some(prediction));
}

#[tokio::test]
async fn capture_reencodes_displayed_mjpeg_frame() {
    let Some(mut server) = start_server_or_skip("capture_reencodes_displayed_mjpeg_frame").await
    else {
        return;
    };
    let mut inference = mockito::Server::new_async().await;
    let mock = inference
        .mock("POST", "/predict")
        .with_status(200)
        .with_body(r#"{"healthy":true,"confidence":97.5}"#)
        .create_async()
        .await;

    let mut config = test_config(&server, format!("{}/predict", inference.url()));
    config.video.mode = ChannelMode::PushStream;
    let link = RobotLink::start(config).unwrap();
    let mut events = link.event_receiver();
    link.connect("r1").await.unwrap();

    let mut channels = server.accept_many(2).await;
    let video = channels.take("/mjpeg/r1");
    let png = png_frame();
    video.send_frame(&png).await;
    video.send_frame(&png).await;
    wait_live(&mut events).await;

    let prediction = link.capture().await.unwrap();
    assert_eq!(prediction.label_text(), "Healthy");
    assert_eq!(prediction.confidence_text(), "98%");
    mock.assert_async().await;
}

#[tokio::test]
async fn failed_inference_releases_the_capture_slot() {
    let Some(mut server) = start_server_or_skip("failed_inference_releases_the_capture_slot").await
    else {
        return;
    };
    let mut inference = mockito::Server::new_async().await;
    let failing = inference
        .mock("POST", "/predict")
        .with_status(503)
        .with_body("model warming up")
        .expect(1)
        .create_async()
        .await;

    let link = RobotLink::start(test_config(&server, format!("{}/predict", inference.url())))
        .unwrap();
    let mut events = link.event_receiver();
    link.connect("r1").await.unwrap();
    let mut channels = server.accept_many(2).await;
    let video = channels.take("/ws/video");
    video.send_frame(b"frame-1").await;
    video.send_frame(b"frame-2").await;
    wait_live(&mut events).await;

    let err = link.capture().await.unwrap_err();
    assert!(
        matches!(
            err,
            LinkError::InferenceRequestFailed {
                status: Some(503),
                ref detail
            } if detail == "model warming up"
        ),
        "{err:?}"
    );
    failing.assert_async().await;
    let last = link.last_capture().unwrap();
    assert_eq!(last.status, CaptureStatus::Failed);
    assert!(last.error.unwrap().contains("503"));

    // The slot is free again.
    failing.remove_async().await;
    let _ok = inference
        .mock("POST", "/predict")
        .with_status(200)
        .with_body("not json at all")
        .create_async()
        .await;
    let prediction = link.capture().await.unwrap();
    assert!(prediction.is_degraded());
    assert_eq!(prediction.raw.as_deref(), Some("not json at all"));
}

#[tokio::test]
async fn capture_before_connect_has_no_frame() {
    let config = {
        let mut config = LinkConfig::new("http://127.0.0.1:9");
        config.inference.url = Some("http://127.0.0.1:9/predict".into());
        config
    };
    let link = RobotLink::start(config).unwrap();
    let mut events = link.event_receiver();

    let err = link.capture().await.unwrap_err();
    assert!(matches!(err, LinkError::NoFrameAvailable));
    assert_eq!(
        capture_statuses(&mut events),
        vec![CaptureStatus::CapturingFrame, CaptureStatus::Failed]
    );
}
