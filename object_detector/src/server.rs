use crate::{
    config::Settings,
    inference_service::InferenceService,
    model_service::{Model, ModelAdapter},
    ort_model::OrtModel,
    state::ServiceState,
};
use std::sync::Arc;
use tokio::signal;
use tonic::transport::server::Router;
use tonic::transport::Server;
use video_proto::object_detector_server::ObjectDetectorServer;

pub struct GrpcServer {
    router: Router,
    addr: String,
}

impl GrpcServer {
    pub async fn new<M: Model>(inference_service: InferenceService<M>, addr: &str) -> Self {
        let reflection_service = tonic_reflection::server::Builder::configure()
            .register_encoded_file_descriptor_set(video_proto::FILE_DESCRIPTOR_SET)
            .build_v1alpha()
            .unwrap();

        // The caller only constructs the server after warmup, so the health
        // service can report SERVING from the start.
        let (mut health_reporter, health_service) = tonic_health::server::health_reporter();
        health_reporter
            .set_serving::<ObjectDetectorServer<InferenceService<M>>>()
            .await;

        let router = Server::builder()
            .add_service(ObjectDetectorServer::new(inference_service))
            .add_service(health_service)
            .add_service(reflection_service);

        Self {
            router,
            addr: addr.to_string(),
        }
    }

    pub async fn run(self) -> Result<(), Box<dyn std::error::Error>> {
        let addr = self.addr.parse().expect("failed to parse address");

        tracing::info!("Object detector service listening on {}", self.addr);

        let shutdown = async {
            shutdown_signal().await;
            tracing::info!("Shutdown signal received, starting graceful shutdown")
        };

        self.router.serve_with_shutdown(addr, shutdown).await?;
        Ok(())
    }
}

pub async fn start_server(config: Settings) -> Result<(), Box<dyn std::error::Error>> {
    let model = OrtModel::new(&config.model, &config.labels);
    let model_adapter = Arc::new(ModelAdapter::new(model));
    // Warmup must complete before the listener starts accepting traffic; a
    // failure here is fatal and is not retried.
    model_adapter.warmup().expect("model warmup failed");

    let state = Arc::new(ServiceState::new(config.detection.confidence_threshold));
    let inference_service = InferenceService::new(model_adapter, state);

    let addr = config.server.get_address();
    let grpc_server = GrpcServer::new(inference_service, &addr).await;

    grpc_server.run().await?;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
