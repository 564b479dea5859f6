// wis2box_processors - Observation processing and publication jobs
//
// Copyright 2024 wis2box_processors authors
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.
//

//! Storage converted data is published from.

use crate::config::StorageConfig;
use async_trait::async_trait;
use object_store::aws::AmazonS3Builder;
use object_store::path::Path;
use object_store::ObjectStore as _;
use object_store::{Attribute, Attributes, PutOptions, PutPayload};
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use reqwest::Url;
use std::sync::Arc;
use thiserror::Error;

/// Characters left as-is in a path segment of an object URL
const SEGMENT: &AsciiSet = &NON_ALPHANUMERIC.remove(b'-').remove(b'_').remove(b'.').remove(b'~');

/// Signing region for S3 compatible services that don't have regions
const DEFAULT_REGION: &str = "us-east-1";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("invalid object path {0}")]
    InvalidPath(String),

    #[error(transparent)]
    Store(#[from] object_store::Error),
}

/// Somewhere converted data can be written for consumers to download.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Store `data` at `path`, returning the public URL it can be retrieved from.
    async fn put(&self, path: &str, data: &[u8], content_type: &str) -> Result<String, StorageError>;
}

/// Path of an object relative to `base` with every segment percent-encoded
fn object_url(base: &Url, path: &str) -> Result<Url, StorageError> {
    let encoded: Vec<String> = path
        .split('/')
        .filter(|s| !s.is_empty())
        .map(|s| utf8_percent_encode(s, SEGMENT).to_string())
        .collect();

    if encoded.is_empty() {
        return Err(StorageError::InvalidPath(path.to_owned()));
    }

    base.join(&encoded.join("/"))
        .map_err(|_| StorageError::InvalidPath(path.to_owned()))
}

/// Location of an object within its bucket
fn object_path(path: &str) -> Result<Path, StorageError> {
    let trimmed = path.trim_matches('/');
    if trimmed.is_empty() {
        return Err(StorageError::InvalidPath(path.to_owned()));
    }

    Path::parse(trimmed).map_err(|_| StorageError::InvalidPath(path.to_owned()))
}

/// Objects in a single bucket, published below a public URL.
#[derive(Debug)]
pub struct BucketStore {
    bucket: Arc<dyn object_store::ObjectStore>,
    public_url: Url,
}

impl BucketStore {
    pub fn new(bucket: Arc<dyn object_store::ObjectStore>, public_url: Url) -> Self {
        BucketStore { bucket, public_url }
    }

    /// Bucket of an S3 compatible service. Requests are signed with the configured
    /// credentials, or sent unsigned when there are none.
    pub fn s3(config: &StorageConfig) -> Result<Self, StorageError> {
        let mut builder = AmazonS3Builder::new()
            .with_endpoint(config.endpoint.as_str().trim_end_matches('/'))
            .with_bucket_name(&config.bucket)
            .with_region(DEFAULT_REGION)
            .with_allow_http(config.endpoint.scheme() == "http");

        builder = match &config.credentials {
            Some(c) => builder
                .with_access_key_id(&c.username)
                .with_secret_access_key(&c.password),
            None => builder.with_skip_signature(true),
        };

        Ok(Self::new(Arc::new(builder.build()?), config.public_url.clone()))
    }
}

#[async_trait]
impl ObjectStore for BucketStore {
    async fn put(&self, path: &str, data: &[u8], content_type: &str) -> Result<String, StorageError> {
        let location = object_path(path)?;
        let public = object_url(&self.public_url, path)?;
        tracing::debug!(message = "storing object", path = %location, num_bytes = data.len());

        let mut attributes = Attributes::new();
        attributes.insert(Attribute::ContentType, content_type.to_owned().into());
        let options = PutOptions {
            attributes,
            ..Default::default()
        };

        self.bucket
            .put_opts(&location, PutPayload::from(data.to_vec()), options)
            .await?;
        Ok(public.to_string())
    }
}
