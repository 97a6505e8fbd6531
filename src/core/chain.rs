use crate::{
    config::models::MiddlewareConfig,
    ports::{
        middleware::{MiddlewareError, MiddlewareFactory},
        transport::SharedTransport,
    },
};

/// Wrap `next` with the configured middlewares.
///
/// The list is applied back to front, so the first declared middleware ends up outermost:
/// it sees the request first and the response last. Unknown middlewares are skipped with an
/// error log; any other resolution failure aborts the chain.
pub fn build_middleware_chain(
    factory: &dyn MiddlewareFactory,
    middlewares: &[MiddlewareConfig],
    mut next: SharedTransport,
) -> Result<SharedTransport, MiddlewareError> {
    for config in middlewares.iter().rev() {
        match factory.build(config) {
            Ok(middleware) => next = middleware(next),
            Err(MiddlewareError::NotFound(name)) => {
                tracing::error!("Skip does not exist middleware: {}", name);
            }
            Err(e) => return Err(e),
        }
    }
    Ok(next)
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use axum::body::Body as AxumBody;
    use hyper::{Request, Response};

    use super::*;
    use crate::ports::{middleware::Middleware, transport::transport_fn};

    type Trace = Arc<Mutex<Vec<String>>>;

    /// Factory whose middlewares record their name on the way in.
    struct Tagging {
        trace: Trace,
    }

    impl MiddlewareFactory for Tagging {
        fn build(&self, config: &MiddlewareConfig) -> Result<Middleware, MiddlewareError> {
            match config.name.as_str() {
                "missing" => Err(MiddlewareError::NotFound(config.name.clone())),
                "broken" => Err(MiddlewareError::Invalid {
                    name: config.name.clone(),
                    reason: "bad options".to_string(),
                }),
                name => {
                    let name = name.to_string();
                    let trace = self.trace.clone();
                    Ok(Arc::new(move |next: SharedTransport| {
                        let name = name.clone();
                        let trace = trace.clone();
                        transport_fn(move |req| {
                            trace.lock().unwrap().push(name.clone());
                            let next = next.clone();
                            async move { next.execute(req).await }
                        })
                    }))
                }
            }
        }
    }

    fn base(trace: Trace) -> SharedTransport {
        transport_fn(move |_req| {
            trace.lock().unwrap().push("transport".to_string());
            async { Ok(Response::new(AxumBody::empty())) }
        })
    }

    fn names(list: &[&str]) -> Vec<MiddlewareConfig> {
        list.iter().map(|n| MiddlewareConfig::new(*n)).collect()
    }

    #[tokio::test]
    async fn test_first_declared_runs_first() {
        let trace: Trace = Arc::default();
        let factory = Tagging {
            trace: trace.clone(),
        };
        let chain =
            build_middleware_chain(&factory, &names(&["a", "b", "c"]), base(trace.clone()))
                .unwrap();

        chain
            .execute(Request::new(AxumBody::empty()))
            .await
            .unwrap();
        assert_eq!(*trace.lock().unwrap(), vec!["a", "b", "c", "transport"]);
    }

    #[tokio::test]
    async fn test_missing_middleware_is_skipped() {
        let trace: Trace = Arc::default();
        let factory = Tagging {
            trace: trace.clone(),
        };
        let chain = build_middleware_chain(
            &factory,
            &names(&["a", "missing", "b"]),
            base(trace.clone()),
        )
        .unwrap();

        chain
            .execute(Request::new(AxumBody::empty()))
            .await
            .unwrap();
        assert_eq!(*trace.lock().unwrap(), vec!["a", "b", "transport"]);
    }

    #[test]
    fn test_invalid_middleware_aborts() {
        let trace: Trace = Arc::default();
        let factory = Tagging {
            trace: trace.clone(),
        };
        let result = build_middleware_chain(&factory, &names(&["a", "broken"]), base(trace));
        assert!(matches!(result, Err(MiddlewareError::Invalid { .. })));
    }
}
