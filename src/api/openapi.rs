//! OpenAPI documentation and schema generation
//!
//! Compile-time OpenAPI spec for the delivery server, generated with utoipa.
//! Served at `/openapi.json`, with Swagger UI at `/swagger-ui` when enabled.

use utoipa::OpenApi;

/// OpenAPI documentation for the media-bridge delivery API
#[derive(OpenApi)]
#[openapi(
    info(
        title = "media-bridge delivery API",
        version = "0.2.0",
        description = "Token-addressed delivery of converted media artifacts, with byte-range resume support",
        license(
            name = "MIT OR Apache-2.0"
        )
    ),
    paths(
        crate::api::routes::health_check,
        crate::api::routes::openapi_spec,
        crate::api::routes::event_stream,
        crate::api::routes::download_artifact,
    ),
    components(schemas(
        crate::error::ApiError,
        crate::error::ErrorDetail,
        crate::types::JobId,
        crate::types::ChatId,
        crate::types::ArtifactToken,
        crate::types::JobStatus,
        crate::types::ProcessingMode,
        crate::types::ConversionSpec,
        crate::types::Job,
    )),
    tags(
        (name = "delivery", description = "Artifact downloads"),
        (name = "system", description = "Health and documentation")
    )
)]
pub struct ApiDoc;

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spec_lists_the_delivery_route() {
        let spec = ApiDoc::openapi();
        let json = serde_json::to_string(&spec).unwrap();

        assert!(json.contains("/download/{token}"));
        assert!(json.contains("/health"));
    }
}
