use std::time::Duration;
use log::debug;
use reqwest::header::{HeaderMap, LOCATION};
use reqwest::{Method, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use crate::gateway::Error;
use crate::poll;
use crate::resources::ResourceId;

const AZURE_ASYNC_OPERATION: &str = "azure-asyncoperation";

/// Authenticated JSON client for the Azure Resource Manager REST API.
pub struct ArmClient {
    http: reqwest::Client,
    endpoint: String,
    subscription: String,
    token: String,
    operation_policy: poll::Policy,
}

#[derive(Deserialize)]
struct OperationStatus {
    status: String,
    error: Option<OperationError>,
}

#[derive(Deserialize)]
struct OperationError {
    code: Option<String>,
    message: Option<String>,
}

/// Where to look for the outcome of a long-running operation.
#[derive(Debug, PartialEq)]
enum Tracking {
    /// Poll until the status document reports a terminal status.
    AsyncOperation(String),
    /// Poll until the URL stops answering 202.
    Location(String),
}

impl Tracking {
    fn from_headers(headers: &HeaderMap) -> Option<Self> {
        let header = |name: &str| {
            headers
                .get(name)
                .and_then(|value| value.to_str().ok())
                .map(str::to_string)
        };
        header(AZURE_ASYNC_OPERATION)
            .map(Tracking::AsyncOperation)
            .or_else(|| header(LOCATION.as_str()).map(Tracking::Location))
    }
}

impl ArmClient {
    pub fn new(
        endpoint: &str,
        subscription: &str,
        token: String,
        operation_policy: poll::Policy,
    ) -> Result<Self, Error> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()?;
        Ok(Self {
            http,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            subscription: subscription.to_string(),
            token,
            operation_policy,
        })
    }

    pub fn resource_group_path(&self, resource_group: &str) -> String {
        format!("/subscriptions/{}/resourceGroups/{resource_group}", self.subscription)
    }

    /// Path of a resource, e.g. `provider_path("rg", "Microsoft.Compute/disks", "disk1")`.
    pub fn provider_path(&self, resource_group: &str, resource_type: &str, name: &str) -> String {
        format!(
            "{}/providers/{resource_type}/{name}",
            self.resource_group_path(resource_group)
        )
    }

    fn url(&self, path: &str, api_version: &str) -> String {
        format!("{}{path}?api-version={api_version}", self.endpoint)
    }

    async fn send(
        &self,
        method: Method,
        path: &str,
        api_version: &str,
        body: Option<&Value>,
    ) -> Result<Response, Error> {
        let url = self.url(path, api_version);
        debug!("{method} {url}");
        let mut request = self.http.request(method.clone(), &url).bearer_auth(&self.token);
        request = match body {
            Some(body) => request.json(body),
            // POST actions without a body still need an explicit length.
            None if method == Method::POST => request.header(reqwest::header::CONTENT_LENGTH, "0"),
            None => request,
        };
        let resp = request.send().await?;
        check_status(method.as_str(), path, resp).await
    }

    pub async fn get<T: DeserializeOwned>(&self, path: &str, api_version: &str) -> Result<T, Error> {
        let resp = self.send(Method::GET, path, api_version, None).await?;
        let url = resp.url().to_string();
        let bytes = resp.bytes().await?;
        serde_json::from_slice(&bytes).map_err(|err| Error::UnexpectedResponse {
            url,
            message: err.to_string(),
        })
    }

    /// Create or replace a resource and wait until it is provisioned.
    pub async fn put(&self, path: &str, api_version: &str, body: &Value) -> Result<ResourceId, Error> {
        let resp = self.send(Method::PUT, path, api_version, Some(body)).await?;
        self.wait(path, Tracking::from_headers(resp.headers())).await?;
        Ok(ResourceId::new(path))
    }

    /// Create or replace a resource without waiting for provisioning to finish.
    pub async fn put_no_wait(&self, path: &str, api_version: &str, body: &Value) -> Result<(), Error> {
        self.send(Method::PUT, path, api_version, Some(body)).await?;
        Ok(())
    }

    /// Invoke an action such as `/deallocate` and wait for it to finish.
    pub async fn post(&self, path: &str, api_version: &str) -> Result<(), Error> {
        let resp = self.send(Method::POST, path, api_version, None).await?;
        self.wait(path, Tracking::from_headers(resp.headers())).await
    }

    /// Delete a resource and wait until it is gone.
    /// A resource that does not exist yields [`Error::NotFound`].
    pub async fn delete(&self, path: &str, api_version: &str) -> Result<(), Error> {
        let resp = self.send(Method::DELETE, path, api_version, None).await?;
        if resp.status() == StatusCode::NO_CONTENT {
            return Err(Error::NotFound(path.to_string()));
        }
        self.wait(path, Tracking::from_headers(resp.headers())).await
    }

    async fn wait(&self, path: &str, tracking: Option<Tracking>) -> Result<(), Error> {
        let Some(tracking) = tracking else {
            return Ok(());
        };
        debug!("Waiting for operation on {path}");
        let tracking = &tracking;
        let result = poll::wait_for(self.operation_policy, move || self.operation_done(path, tracking)).await;
        match result {
            Ok(()) => Ok(()),
            Err(poll::Error::TimedOut { .. }) => Err(Error::OperationTimedOut(path.to_string())),
            Err(poll::Error::Read(err)) => Err(err),
        }
    }

    async fn operation_done(&self, path: &str, tracking: &Tracking) -> Result<bool, Error> {
        match tracking {
            Tracking::AsyncOperation(url) => {
                let resp = self.http.get(url).bearer_auth(&self.token).send().await?;
                let resp = check_status("GET", url, resp).await?;
                let status: OperationStatus = resp.json().await?;
                operation_outcome(path, status)
            }
            Tracking::Location(url) => {
                let resp = self.http.get(url).bearer_auth(&self.token).send().await?;
                let resp = check_status("GET", url, resp).await?;
                Ok(resp.status() != StatusCode::ACCEPTED)
            }
        }
    }
}

fn operation_outcome(path: &str, status: OperationStatus) -> Result<bool, Error> {
    match status.status.as_str() {
        "Succeeded" => Ok(true),
        "Failed" | "Canceled" => {
            let (code, message) = status
                .error
                .map(|err| (err.code.unwrap_or_default(), err.message.unwrap_or_default()))
                .unwrap_or_default();
            Err(Error::OperationFailed {
                resource: path.to_string(),
                status: status.status,
                message: format!("{code}: {message}"),
            })
        }
        _ => Ok(false),
    }
}

async fn check_status(method: &str, path: &str, resp: Response) -> Result<Response, Error> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    if status == StatusCode::NOT_FOUND {
        return Err(Error::NotFound(path.to_string()));
    }
    let url = resp.url().to_string();
    let body = resp.text().await.unwrap_or_default();
    Err(Error::Api {
        method: method.to_string(),
        url,
        status: status.as_u16(),
        body,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    fn client() -> ArmClient {
        ArmClient::new(
            "https://management.azure.com/",
            "sub-1",
            "token".into(),
            poll::Policy::from_secs(5, 3),
        )
        .unwrap()
    }

    #[test]
    fn builds_resource_paths_and_urls() {
        let arm = client();
        let path = arm.provider_path("rg-prod", "Microsoft.Compute/snapshots", "web01202610191542");
        assert_eq!(
            path,
            "/subscriptions/sub-1/resourceGroups/rg-prod/providers/Microsoft.Compute/snapshots/web01202610191542"
        );
        assert_eq!(
            arm.url(&path, "2023-10-02"),
            format!("https://management.azure.com{path}?api-version=2023-10-02")
        );
    }

    #[test]
    fn async_operation_header_wins_over_location() {
        let mut headers = HeaderMap::new();
        assert_eq!(Tracking::from_headers(&headers), None);

        headers.insert(LOCATION, HeaderValue::from_static("https://arm/location"));
        assert_eq!(
            Tracking::from_headers(&headers),
            Some(Tracking::Location("https://arm/location".into()))
        );

        headers.insert("Azure-AsyncOperation", HeaderValue::from_static("https://arm/operation"));
        assert_eq!(
            Tracking::from_headers(&headers),
            Some(Tracking::AsyncOperation("https://arm/operation".into()))
        );
    }

    #[test]
    fn operation_statuses() {
        let status = |status: &str| OperationStatus {
            status: status.into(),
            error: None,
        };
        assert!(operation_outcome("/x", status("Succeeded")).unwrap());
        assert!(!operation_outcome("/x", status("InProgress")).unwrap());
        assert!(matches!(
            operation_outcome("/x", OperationStatus {
                status: "Failed".into(),
                error: Some(OperationError {
                    code: Some("OSProvisioningTimedOut".into()),
                    message: Some("took too long".into()),
                }),
            }),
            Err(Error::OperationFailed { message, .. }) if message == "OSProvisioningTimedOut: took too long"
        ));
    }
}
