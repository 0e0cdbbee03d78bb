// Copyright (c) GridEx, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Read-only contract calls: pair token resolution on the exchange and
//! ERC-20 metadata lookups.

use std::sync::Arc;

use ethers::abi::{Abi, Token};
use ethers::types::{Address, Bytes};
use once_cell::sync::Lazy;
use tracing::warn;

use crate::error::{IndexerError, IndexerResult};
use crate::rpc::ChainRpc;

/// Exchange views the indexer consumes.
const GRIDEX_CALLER_ABI_JSON: &str = r#"[
  {
    "inputs": [{"name": "pairId", "type": "uint64"}],
    "name": "getPairTokens",
    "outputs": [
      {"name": "base", "type": "address"},
      {"name": "quote", "type": "address"}
    ],
    "stateMutability": "view",
    "type": "function"
  }
]"#;

const ERC20_ABI_JSON: &str = r#"[
  {
    "inputs": [],
    "name": "name",
    "outputs": [{"name": "", "type": "string"}],
    "stateMutability": "view",
    "type": "function"
  },
  {
    "inputs": [],
    "name": "symbol",
    "outputs": [{"name": "", "type": "string"}],
    "stateMutability": "view",
    "type": "function"
  },
  {
    "inputs": [],
    "name": "decimals",
    "outputs": [{"name": "", "type": "uint8"}],
    "stateMutability": "view",
    "type": "function"
  }
]"#;

static GRIDEX_CALLER_ABI: Lazy<Abi> =
    Lazy::new(|| serde_json::from_str(GRIDEX_CALLER_ABI_JSON).expect("valid caller abi"));

static ERC20_ABI: Lazy<Abi> =
    Lazy::new(|| serde_json::from_str(ERC20_ABI_JSON).expect("valid erc20 abi"));

/// ERC-20 token metadata fetched from chain.
#[derive(Debug, Clone)]
pub struct TokenInfo {
    pub address: Address,
    pub name: String,
    pub symbol: String,
    pub decimals: u8,
}

/// Makes read-only calls to the GridEx exchange and ERC-20 tokens.
pub struct Caller<C> {
    client: Arc<C>,
    gridex_addr: Address,
}

impl<C: ChainRpc> Caller<C> {
    pub fn new(client: Arc<C>, gridex_addr: Address) -> Self {
        Self {
            client,
            gridex_addr,
        }
    }

    /// `getPairTokens(uint64)` on the exchange: the pair's base and quote
    /// token addresses.
    pub async fn get_pair_tokens(&self, pair_id: u64) -> IndexerResult<(Address, Address)> {
        let function = GRIDEX_CALLER_ABI
            .function("getPairTokens")
            .map_err(|e| IndexerError::ContractCall(format!("getPairTokens abi: {e}")))?;
        let data = function
            .encode_input(&[Token::Uint(pair_id.into())])
            .map_err(|e| IndexerError::ContractCall(format!("encode getPairTokens: {e}")))?;

        let result = self.client.call(self.gridex_addr, Bytes::from(data)).await?;

        let mut values = function
            .decode_output(&result)
            .map_err(|e| IndexerError::ContractCall(format!("decode getPairTokens: {e}")))?
            .into_iter();
        let base = values
            .next()
            .and_then(Token::into_address)
            .ok_or_else(|| IndexerError::ContractCall("getPairTokens: missing base".into()))?;
        let quote = values
            .next()
            .and_then(Token::into_address)
            .ok_or_else(|| IndexerError::ContractCall("getPairTokens: missing quote".into()))?;
        Ok((base, quote))
    }

    /// Fetch ERC-20 metadata, degrading gracefully: tokens without `name` or
    /// `symbol` get empty strings, a failed `decimals` defaults to 18.
    pub async fn get_token_info(&self, token_addr: Address) -> IndexerResult<TokenInfo> {
        let name = match self.call_string(token_addr, "name").await {
            Ok(name) => name,
            Err(e) => {
                warn!(token = ?token_addr, error = %e, "ERC20 name() call failed");
                String::new()
            }
        };

        let symbol = match self.call_string(token_addr, "symbol").await {
            Ok(symbol) => symbol,
            Err(e) => {
                warn!(token = ?token_addr, error = %e, "ERC20 symbol() call failed");
                String::new()
            }
        };

        let decimals = match self.call_decimals(token_addr).await {
            Ok(decimals) => decimals,
            Err(e) => {
                warn!(token = ?token_addr, error = %e, "ERC20 decimals() call failed, defaulting to 18");
                18
            }
        };

        Ok(TokenInfo {
            address: token_addr,
            name,
            symbol,
            decimals,
        })
    }

    async fn call_string(&self, token_addr: Address, method: &str) -> IndexerResult<String> {
        let function = ERC20_ABI
            .function(method)
            .map_err(|e| IndexerError::ContractCall(format!("{method} abi: {e}")))?;
        let data = function
            .encode_input(&[])
            .map_err(|e| IndexerError::ContractCall(format!("encode {method}: {e}")))?;

        let result = self.client.call(token_addr, Bytes::from(data)).await?;

        function
            .decode_output(&result)
            .map_err(|e| IndexerError::ContractCall(format!("decode {method}: {e}")))?
            .into_iter()
            .next()
            .and_then(Token::into_string)
            .ok_or_else(|| IndexerError::ContractCall(format!("{method}: not a string")))
    }

    async fn call_decimals(&self, token_addr: Address) -> IndexerResult<u8> {
        let function = ERC20_ABI
            .function("decimals")
            .map_err(|e| IndexerError::ContractCall(format!("decimals abi: {e}")))?;
        let data = function
            .encode_input(&[])
            .map_err(|e| IndexerError::ContractCall(format!("encode decimals: {e}")))?;

        let result = self.client.call(token_addr, Bytes::from(data)).await?;

        let value = function
            .decode_output(&result)
            .map_err(|e| IndexerError::ContractCall(format!("decode decimals: {e}")))?
            .into_iter()
            .next()
            .and_then(Token::into_uint)
            .ok_or_else(|| IndexerError::ContractCall("decimals: not a uint".into()))?;
        Ok(value.as_u32() as u8)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use ethers::abi::encode;
    use ethers::types::{Block, Filter, Log, TransactionReceipt, TxHash};
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// Answers eth_call by function selector.
    struct CallRpc {
        responses: Mutex<HashMap<Vec<u8>, IndexerResult<Bytes>>>,
    }

    impl CallRpc {
        fn new() -> Self {
            Self {
                responses: Mutex::new(HashMap::new()),
            }
        }

        fn respond(&self, abi: &Abi, method: &str, output: Vec<Token>) {
            let selector = abi.function(method).unwrap().short_signature().to_vec();
            self.responses
                .lock()
                .unwrap()
                .insert(selector, Ok(Bytes::from(encode(&output))));
        }

        fn fail(&self, abi: &Abi, method: &str) {
            let selector = abi.function(method).unwrap().short_signature().to_vec();
            self.responses
                .lock()
                .unwrap()
                .insert(selector, Err(IndexerError::Rpc("execution reverted".into())));
        }
    }

    #[async_trait]
    impl ChainRpc for CallRpc {
        async fn block_number(&self) -> IndexerResult<u64> {
            unimplemented!("not used")
        }

        async fn get_logs(&self, _filter: &Filter) -> IndexerResult<Vec<Log>> {
            unimplemented!("not used")
        }

        async fn block_by_number(&self, _number: u64) -> IndexerResult<Option<Block<TxHash>>> {
            unimplemented!("not used")
        }

        async fn transaction_receipt(
            &self,
            _tx_hash: TxHash,
        ) -> IndexerResult<Option<TransactionReceipt>> {
            unimplemented!("not used")
        }

        async fn call(&self, _to: Address, data: Bytes) -> IndexerResult<Bytes> {
            let selector = data[..4].to_vec();
            match self.responses.lock().unwrap().get(&selector) {
                Some(Ok(bytes)) => Ok(bytes.clone()),
                Some(Err(_)) => Err(IndexerError::Rpc("execution reverted".into())),
                None => panic!("unexpected call with selector {selector:?}"),
            }
        }
    }

    #[tokio::test]
    async fn test_get_pair_tokens() {
        let base: Address = "0x00000000000000000000000000000000000000Ab"
            .parse()
            .unwrap();
        let quote: Address = "0x00000000000000000000000000000000000000Cd"
            .parse()
            .unwrap();

        let rpc = CallRpc::new();
        rpc.respond(
            &GRIDEX_CALLER_ABI,
            "getPairTokens",
            vec![Token::Address(base), Token::Address(quote)],
        );

        let caller = Caller::new(Arc::new(rpc), Address::repeat_byte(1));
        let (got_base, got_quote) = caller.get_pair_tokens(7).await.unwrap();
        assert_eq!(got_base, base);
        assert_eq!(got_quote, quote);
    }

    #[tokio::test]
    async fn test_token_info_happy_path() {
        let rpc = CallRpc::new();
        rpc.respond(&ERC20_ABI, "name", vec![Token::String("Tether USD".into())]);
        rpc.respond(&ERC20_ABI, "symbol", vec![Token::String("USDT".into())]);
        rpc.respond(
            &ERC20_ABI,
            "decimals",
            vec![Token::Uint(18u64.into())],
        );

        let caller = Caller::new(Arc::new(rpc), Address::repeat_byte(1));
        let info = caller
            .get_token_info(Address::repeat_byte(2))
            .await
            .unwrap();
        assert_eq!(info.name, "Tether USD");
        assert_eq!(info.symbol, "USDT");
        assert_eq!(info.decimals, 18);
    }

    #[tokio::test]
    async fn test_token_info_degrades_gracefully() {
        let rpc = CallRpc::new();
        rpc.fail(&ERC20_ABI, "name");
        rpc.fail(&ERC20_ABI, "symbol");
        rpc.fail(&ERC20_ABI, "decimals");

        let caller = Caller::new(Arc::new(rpc), Address::repeat_byte(1));
        let info = caller
            .get_token_info(Address::repeat_byte(2))
            .await
            .unwrap();
        assert_eq!(info.name, "");
        assert_eq!(info.symbol, "");
        assert_eq!(info.decimals, 18);
    }
}
