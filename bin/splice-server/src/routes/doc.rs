use utoipa::OpenApi;

use super::{composition, health};

#[derive(OpenApi)]
#[openapi(info(
    title = "splice-server",
    description = "asynchronous video composition API",
    version = "0.1.0",
    contact(name = "splice-rs", url = "https://github.com/splice-rs/splice")
))]
pub struct ApiDoc;

pub fn get_docs() -> utoipa::openapi::OpenApi {
    let mut root = ApiDoc::openapi();
    root.merge(health::HealthApi::openapi());
    root.merge(composition::CompositionApi::openapi());
    root
}
