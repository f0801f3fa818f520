use utoipa::openapi::security::{HttpAuthScheme, HttpBuilder, SecurityScheme};
use utoipa::{Modify, OpenApi};

use crate::routes;

#[derive(OpenApi)]
#[openapi(
    info(
        title = "bindery",
        description = "Publish session coordination between interactive clients and CI runners"
    ),
    paths(
        routes::health::health,
        routes::health::health_store,
        routes::publish::session::create_session,
        routes::publish::session::get_status,
        routes::publish::session::combined_token,
    ),
    components(schemas(
        crate::publish::PublishStatus,
        crate::publish::RunnerInfo,
        crate::publish::PublishResult,
        crate::publish::PublishErrorInfo,
        routes::publish::session::SessionView,
        routes::publish::session::CreateSessionRequest,
        routes::publish::session::CombinedTokenResponse,
    )),
    modifiers(&SecurityAddon)
)]
pub struct ApiDoc;

struct SecurityAddon;

impl Modify for SecurityAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        let components = openapi.components.get_or_insert_with(Default::default);
        components.add_security_scheme(
            "bearer",
            SecurityScheme::Http(
                HttpBuilder::new()
                    .scheme(HttpAuthScheme::Bearer)
                    .bearer_format("JWT")
                    .build(),
            ),
        );
    }
}
