// Copyright (c) GridEx, Inc.
// SPDX-License-Identifier: Apache-2.0

use thiserror::Error;

/// Errors produced by the indexer core.
///
/// `Rpc` preserves the provider's message text verbatim: the adaptive log
/// fetcher classifies range-too-wide responses by substring matching on it.
#[derive(Debug, Error)]
pub enum IndexerError {
    #[error("config error: {0}")]
    Config(String),

    #[error("rpc error: {0}")]
    Rpc(String),

    #[error("contract call error: {0}")]
    ContractCall(String),

    #[error("decode error: {0}")]
    Decode(String),

    #[error("no strategy cached for grid {0}")]
    MissingStrategy(String),

    #[error("database error: {0}")]
    Db(#[from] diesel::result::Error),

    #[error("connection pool error: {0}")]
    Pool(String),

    #[error("kafka error: {0}")]
    Kafka(String),

    #[error("operation cancelled")]
    Cancelled,
}

pub type IndexerResult<T> = Result<T, IndexerError>;

impl From<ethers::providers::ProviderError> for IndexerError {
    fn from(err: ethers::providers::ProviderError) -> Self {
        IndexerError::Rpc(err.to_string())
    }
}

impl From<rdkafka::error::KafkaError> for IndexerError {
    fn from(err: rdkafka::error::KafkaError) -> Self {
        IndexerError::Kafka(err.to_string())
    }
}
