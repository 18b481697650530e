//! HTTP exposition of the Teleinfo metrics
use std::sync::Arc;

use axum::{
    Router,
    extract::State,
    http::{HeaderValue, StatusCode, header},
    middleware,
    response::{IntoResponse, Response},
    routing::get,
};
use prometheus::{IntCounter, IntGauge, Opts, Registry, TextEncoder};
use tokio::{io::AsyncRead, sync::mpsc};
use tracing::{debug, error};

use crate::{
    metrics::{Collection, MetricKind},
    proc::TeleinfoProc,
    teleinfo::TeleinfoError,
};

/// Render a collection in the Prometheus text format
pub fn encode(collection: &Collection) -> Result<String, TeleinfoError> {
    let registry = Registry::new();
    for (name, help, kind, value, labels) in collection.metrics() {
        let opts = Opts::new(name, help).const_labels(labels.to_map());
        match kind {
            MetricKind::Counter => {
                let counter = IntCounter::with_opts(opts)?;
                counter.inc_by(value);
                registry.register(Box::new(counter))?;
            }
            MetricKind::Gauge => {
                let gauge = IntGauge::with_opts(opts)?;
                gauge.set(i64::try_from(value).map_err(|_| {
                    TeleinfoError::MetricValue(name.to_string(), value.to_string())
                })?);
                registry.register(Box::new(gauge))?;
            }
        }
    }

    let mut buffer = String::new();
    TextEncoder::new().encode_utf8(&registry.gather(), &mut buffer)?;
    Ok(buffer)
}

struct ExporterState<S> {
    proc: Arc<TeleinfoProc<S>>,
    fatal: mpsc::Sender<TeleinfoError>,
}

impl<S> Clone for ExporterState<S> {
    fn clone(&self) -> Self {
        ExporterState {
            proc: self.proc.clone(),
            fatal: self.fatal.clone(),
        }
    }
}

/// HTTP routes of the exporter.
///
/// A failing collection answers an error and is sent to `fatal` for the process to stop.
pub fn router<S>(proc: Arc<TeleinfoProc<S>>, fatal: mpsc::Sender<TeleinfoError>) -> Router
where
    S: AsyncRead + Unpin + Send + 'static,
{
    Router::new()
        .route("/", get(redirect_metrics))
        .route("/favicon.ico", get(favicon))
        .route("/metrics", get(metrics::<S>))
        .fallback(not_found)
        .layer(middleware::map_response(no_cache))
        .with_state(ExporterState { proc, fatal })
}

async fn redirect_metrics() -> impl IntoResponse {
    (StatusCode::MOVED_PERMANENTLY, [(header::LOCATION, "/metrics")])
}

async fn favicon() -> StatusCode {
    StatusCode::OK
}

async fn not_found() -> StatusCode {
    StatusCode::NOT_FOUND
}

async fn metrics<S>(State(state): State<ExporterState<S>>) -> Response
where
    S: AsyncRead + Unpin + Send + 'static,
{
    match state.proc.collect().await.and_then(|c| encode(&c)) {
        Ok(body) => {
            debug!("Scrape served");
            ([(header::CONTENT_TYPE, prometheus::TEXT_FORMAT)], body).into_response()
        }
        Err(e) => {
            error!("Can't collect Teleinfo metrics: {}", e);
            if state.fatal.try_send(e).is_err() {
                debug!("Exporter already stopping");
            }
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn no_cache(mut response: Response) -> Response {
    let headers = response.headers_mut();
    headers.insert(
        header::CACHE_CONTROL,
        HeaderValue::from_static("no-cache, no-store, must-revalidate, max-age=0"),
    );
    headers.insert(header::PRAGMA, HeaderValue::from_static("no-cache"));
    headers.insert(header::EXPIRES, HeaderValue::from_static("0"));
    headers.insert(
        header::X_CONTENT_TYPE_OPTIONS,
        HeaderValue::from_static("nosniff"),
    );
    response
}

#[cfg(test)]
mod tests {
    use std::{io::Cursor, sync::Arc};

    use axum::{
        Router,
        body::{Body, to_bytes},
        http::{Request, StatusCode, header},
    };
    use tokio::sync::mpsc;
    use tower::ServiceExt as _;

    use crate::{
        metrics::{Collection, LabelSet, MetricKind, Sample},
        proc::{TeleinfoProc, TeleinfoSettings},
        registry::FieldRegistry,
        teleinfo::{Teleinfo, TeleinfoError, checksum},
    };

    use super::{encode, router};

    fn meter_data(groups: &[(&str, &str)]) -> Vec<u8> {
        let mut data = vec![0x02, 0x0A];
        for (tag, value) in groups {
            data.extend(format!("{tag} {value} {}\r\n", checksum(tag, value)).into_bytes());
        }
        data.truncate(data.len() - 1);
        data.extend_from_slice(&[0x03, 0x02, 0x0A]);
        data
    }

    fn exporter(data: Vec<u8>) -> (Router, mpsc::Receiver<TeleinfoError>) {
        let proc = TeleinfoProc::new(
            TeleinfoSettings::default(),
            FieldRegistry::linky(),
            Teleinfo::with_stream(Cursor::new(data)),
        );
        let (fatal_tx, fatal_rx) = mpsc::channel(1);
        (router(Arc::new(proc), fatal_tx), fatal_rx)
    }

    async fn get(app: Router, uri: &str) -> axum::response::Response {
        app.oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap()
    }

    #[test]
    fn encode_collection() {
        let mut labels = LabelSet::new("linky-exporter");
        labels.insert("optarif".into(), "BASE".into());
        let collection = Collection {
            labels,
            samples: vec![
                Sample {
                    name: "linky_base".into(),
                    description: "Index Option Base en Wh",
                    kind: MetricKind::Counter,
                    value: 2809718,
                },
                Sample {
                    name: "linky_papp".into(),
                    description: "Puissance Apparente en VA",
                    kind: MetricKind::Gauge,
                    value: 420,
                },
            ],
        };

        let text = encode(&collection).unwrap();
        assert!(text.contains("# HELP linky_base Index Option Base en Wh\n"));
        assert!(text.contains("# TYPE linky_base counter\n"));
        assert!(text.contains("linky_base{job=\"linky-exporter\",optarif=\"BASE\"} 2809718\n"));
        assert!(text.contains("# TYPE linky_papp gauge\n"));
        assert!(text.contains("linky_papp{job=\"linky-exporter\",optarif=\"BASE\"} 420\n"));

        // Two samples with the same name can't be exported
        let duplicated = Collection {
            labels: LabelSet::new("linky-exporter"),
            samples: vec![collection.samples[1].clone(), collection.samples[1].clone()],
        };
        assert!(matches!(
            encode(&duplicated),
            Err(TeleinfoError::MetricsErr(_))
        ));
    }

    #[test]
    fn encode_gauge_out_of_range() {
        let collection = Collection {
            labels: LabelSet::new("x"),
            samples: vec![Sample {
                name: "linky_papp".into(),
                description: "Puissance Apparente en VA",
                kind: MetricKind::Gauge,
                value: 10000000000000000000,
            }],
        };
        assert!(matches!(
            encode(&collection),
            Err(TeleinfoError::MetricValue(name, value)) if name == "linky_papp" && value == "10000000000000000000"
        ));
    }

    #[tokio::test]
    async fn http_routes() {
        let (app, _fatal) = exporter(Vec::new());

        let response = get(app.clone(), "/").await;
        assert_eq!(StatusCode::MOVED_PERMANENTLY, response.status());
        assert_eq!("/metrics", response.headers()[header::LOCATION]);
        assert_eq!("no-cache", response.headers()[header::PRAGMA]);

        let response = get(app.clone(), "/favicon.ico").await;
        assert_eq!(StatusCode::OK, response.status());
        assert!(
            to_bytes(response.into_body(), usize::MAX)
                .await
                .unwrap()
                .is_empty()
        );

        let response = get(app, "/index.html").await;
        assert_eq!(StatusCode::NOT_FOUND, response.status());
    }

    #[tokio::test]
    async fn http_metrics() {
        let (app, mut fatal) = exporter(meter_data(&[
            ("ADCO", "041876097467"),
            ("OPTARIF", "BASE"),
            ("BASE", "002809718"),
            ("IINST", "002"),
        ]));

        let response = get(app.clone(), "/metrics").await;
        assert_eq!(StatusCode::OK, response.status());
        assert_eq!(
            prometheus::TEXT_FORMAT,
            response.headers()[header::CONTENT_TYPE]
        );
        assert_eq!(
            "no-cache, no-store, must-revalidate, max-age=0",
            response.headers()[header::CACHE_CONTROL]
        );
        assert_eq!("0", response.headers()[header::EXPIRES]);
        assert_eq!("nosniff", response.headers()[header::X_CONTENT_TYPE_OPTIONS]);

        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let text = String::from_utf8(body.to_vec()).unwrap();
        assert!(text.contains(
            "linky_base{adco=\"041876097467\",job=\"linky-exporter\",optarif=\"BASE\"} 2809718\n"
        ));
        assert!(text.contains(
            "linky_iinst{adco=\"041876097467\",job=\"linky-exporter\",optarif=\"BASE\"} 2\n"
        ));
        assert!(!text.contains("linky_optarif"));
        assert!(fatal.try_recv().is_err());

        // The meter stream is over, the exporter must stop
        let response = get(app, "/metrics").await;
        assert_eq!(StatusCode::INTERNAL_SERVER_ERROR, response.status());
        assert!(matches!(fatal.try_recv(), Ok(TeleinfoError::IoErr(_))));
    }
}
