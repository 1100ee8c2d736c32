use gslauncher::dispatch::{ClusterCapacity, ClusterControl, HttpClusterControl};
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

#[tokio::test]
async fn start_and_stop_post_to_resource_paths_with_bearer_token() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/clusters/asg-arma/start"))
        .and(header("authorization", "Bearer secret"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/clusters/asg-arma/stop"))
        .and(header("authorization", "Bearer secret"))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;

    let control =
        HttpClusterControl::new(format!("{}/", server.uri()), Some("secret".to_string())).unwrap();
    assert!(control.start_cluster("asg-arma").await);
    assert!(control.stop_cluster("asg-arma").await);
}

#[tokio::test]
async fn non_success_and_unreachable_report_false() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/clusters/asg-arma/start"))
        .respond_with(ResponseTemplate::new(409))
        .mount(&server)
        .await;

    let control = HttpClusterControl::new(server.uri(), None).unwrap();
    assert!(!control.start_cluster("asg-arma").await);

    // Nothing listens on port 9 locally.
    let offline = HttpClusterControl::new("http://127.0.0.1:9", None).unwrap();
    assert!(!offline.stop_cluster("asg-arma").await);
}

#[tokio::test]
async fn status_parses_capacity_and_surfaces_errors() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/clusters/asg-mumble/status"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "instanceCount": 1,
            "status": "InService"
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/clusters/asg-arma/status"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let control = HttpClusterControl::new(server.uri(), None).unwrap();
    assert_eq!(
        control.check_cluster_status("asg-mumble").await.unwrap(),
        ClusterCapacity {
            instance_count: 1,
            status: "InService".to_string(),
        }
    );

    let err = control.check_cluster_status("asg-arma").await.unwrap_err();
    assert!(format!("{err:#}").contains("500"));
}
