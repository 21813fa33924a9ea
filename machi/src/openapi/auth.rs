//! Auth resolution for the OpenAPI connector (spec §4.2 step 3).
//!
//! `AuthSpec`/`ApiKeyLocation` already live on [`crate::run::RunConfig`] as
//! `request_auth_overrides`, so this module only applies one to a request
//! rather than defining a second, competing auth type.

use reqwest::RequestBuilder;

use crate::run::{ApiKeyLocation, AuthSpec};

/// Apply `auth` to an in-flight request builder. `AuthSpec::None` is a no-op;
/// every other variant attaches credentials at the location the spec names.
#[must_use]
pub fn apply_auth(builder: RequestBuilder, auth: &AuthSpec) -> RequestBuilder {
    match auth {
        AuthSpec::None => builder,
        AuthSpec::ApiKey { location, name, value } => match location {
            ApiKeyLocation::Header => builder.header(name, value),
            ApiKeyLocation::Query => builder.query(&[(name.as_str(), value.as_str())]),
            ApiKeyLocation::Cookie => builder.header("Cookie", format!("{name}={value}")),
        },
        AuthSpec::Bearer { token } => builder.bearer_auth(token),
        AuthSpec::Basic { username, password } => builder.basic_auth(username, Some(password)),
        AuthSpec::OAuth2 { access_token } => builder.bearer_auth(access_token),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn api_key_in_header_is_attached_as_a_header() {
        let client = reqwest::Client::new();
        let builder = client.get("https://example.com");
        let auth = AuthSpec::ApiKey {
            location: ApiKeyLocation::Header,
            name: "X-Api-Key".to_string(),
            value: "secret".to_string(),
        };
        let request = apply_auth(builder, &auth).build().unwrap();
        assert_eq!(request.headers().get("X-Api-Key").unwrap(), "secret");
    }

    #[test]
    fn bearer_sets_authorization_header() {
        let client = reqwest::Client::new();
        let builder = client.get("https://example.com");
        let request = apply_auth(builder, &AuthSpec::Bearer { token: "tok".to_string() })
            .build()
            .unwrap();
        assert_eq!(request.headers().get("Authorization").unwrap(), "Bearer tok");
    }

    #[test]
    fn none_leaves_request_unmodified() {
        let client = reqwest::Client::new();
        let builder = client.get("https://example.com");
        let request = apply_auth(builder, &AuthSpec::None).build().unwrap();
        assert!(request.headers().get("Authorization").is_none());
    }
}
