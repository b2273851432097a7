//! Decoding of registry contract logs into typed table events.
//!
//! Topics and ABI layouts must match the deployed registry contract
//! exactly; logs with unknown topics are skipped with a warning.

use ethers::abi::{self, ParamType, Token};
use ethers::types::{Address, Log, H256, U256};
use ethers::utils::keccak256;
use tracing::warn;

use tabledger_core::types::TableEvent;
use tabledger_core::{Error, Result};

/// Event signatures recognized on the registry contract:
///
/// - `CreateTable(address indexed owner, uint256 tableId, string statement)`
/// - `RunSQL(address indexed caller, bool isOwner, uint256 tableId, string statement)`
/// - `SetController(address indexed caller, uint256 tableId, address controller)`
/// - `Transfer(address indexed from, address indexed to, uint256 indexed tokenId)`
#[derive(Debug, Clone)]
pub struct EventDecoder {
    create_table: H256,
    run_sql: H256,
    set_controller: H256,
    transfer: H256,
}

impl Default for EventDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl EventDecoder {
    pub fn new() -> Self {
        Self {
            create_table: H256::from(keccak256("CreateTable(address,uint256,string)")),
            run_sql: H256::from(keccak256("RunSQL(address,bool,uint256,string)")),
            set_controller: H256::from(keccak256("SetController(address,uint256,address)")),
            transfer: H256::from(keccak256("Transfer(address,address,uint256)")),
        }
    }

    /// Decode a contract log into a typed event.
    ///
    /// Returns `Ok(None)` for logs whose topic is not a registry signature;
    /// returns an error for logs that carry a known topic but malformed data.
    pub fn decode(&self, log: &Log) -> Result<Option<TableEvent>> {
        let topic0 = match log.topics.first() {
            Some(topic) => *topic,
            None => return Ok(None),
        };

        if topic0 == self.create_table {
            self.decode_create_table(log).map(Some)
        } else if topic0 == self.run_sql {
            self.decode_run_sql(log).map(Some)
        } else if topic0 == self.set_controller {
            self.decode_set_controller(log).map(Some)
        } else if topic0 == self.transfer {
            self.decode_transfer(log).map(Some)
        } else {
            warn!(topic = %topic0, "skipping log with unknown event signature");
            Ok(None)
        }
    }

    fn decode_create_table(&self, log: &Log) -> Result<TableEvent> {
        let owner = indexed_address(log, 1, "CreateTable.owner")?;
        let tokens = decode_data(
            &[ParamType::Uint(256), ParamType::String],
            log,
            "CreateTable",
        )?;
        Ok(TableEvent::CreateTable {
            owner,
            table_id: uint_token(&tokens[0], "CreateTable.tableId")?,
            statement: string_token(&tokens[1], "CreateTable.statement")?,
        })
    }

    fn decode_run_sql(&self, log: &Log) -> Result<TableEvent> {
        let caller = indexed_address(log, 1, "RunSQL.caller")?;
        let tokens = decode_data(
            &[ParamType::Bool, ParamType::Uint(256), ParamType::String],
            log,
            "RunSQL",
        )?;
        let is_owner = match tokens[0] {
            Token::Bool(b) => b,
            _ => return Err(Error::chain("RunSQL.isOwner is not a bool")),
        };
        Ok(TableEvent::RunSql {
            caller,
            is_owner,
            table_id: uint_token(&tokens[1], "RunSQL.tableId")?,
            statement: string_token(&tokens[2], "RunSQL.statement")?,
        })
    }

    fn decode_set_controller(&self, log: &Log) -> Result<TableEvent> {
        let caller = indexed_address(log, 1, "SetController.caller")?;
        let tokens = decode_data(
            &[ParamType::Uint(256), ParamType::Address],
            log,
            "SetController",
        )?;
        let controller = match &tokens[1] {
            Token::Address(addr) => format_address(*addr),
            _ => return Err(Error::chain("SetController.controller is not an address")),
        };
        Ok(TableEvent::SetController {
            caller,
            table_id: uint_token(&tokens[0], "SetController.tableId")?,
            controller,
        })
    }

    fn decode_transfer(&self, log: &Log) -> Result<TableEvent> {
        // ERC-721 Transfer carries all three parameters as topics.
        let from = indexed_address(log, 1, "Transfer.from")?;
        let to = indexed_address(log, 2, "Transfer.to")?;
        let token_id = log
            .topics
            .get(3)
            .ok_or_else(|| Error::chain("Transfer.tokenId topic missing"))?;
        Ok(TableEvent::TransferTable {
            from,
            to,
            table_id: u256_to_u64(U256::from_big_endian(token_id.as_bytes()), "Transfer.tokenId")?,
        })
    }
}

fn decode_data(types: &[ParamType], log: &Log, event: &str) -> Result<Vec<Token>> {
    let tokens = abi::decode(types, &log.data)
        .map_err(|e| Error::chain(format!("malformed {event} data: {e}")))?;
    if tokens.len() != types.len() {
        return Err(Error::chain(format!("malformed {event} data: arity mismatch")));
    }
    Ok(tokens)
}

fn indexed_address(log: &Log, index: usize, field: &str) -> Result<String> {
    let topic = log
        .topics
        .get(index)
        .ok_or_else(|| Error::chain(format!("{field} topic missing")))?;
    Ok(format_address(Address::from_slice(&topic.as_bytes()[12..])))
}

fn uint_token(token: &Token, field: &str) -> Result<u64> {
    match token {
        Token::Uint(value) => u256_to_u64(*value, field),
        _ => Err(Error::chain(format!("{field} is not a uint"))),
    }
}

fn string_token(token: &Token, field: &str) -> Result<String> {
    match token {
        Token::String(s) => Ok(s.clone()),
        _ => Err(Error::chain(format!("{field} is not a string"))),
    }
}

fn u256_to_u64(value: U256, field: &str) -> Result<u64> {
    if value > U256::from(u64::MAX) {
        return Err(Error::chain(format!("{field} does not fit in 64 bits")));
    }
    Ok(value.as_u64())
}

/// Lowercase 0x-prefixed address form used throughout the validator
pub fn format_address(address: Address) -> String {
    format!("{address:#x}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use ethers::abi::Token;

    fn address(n: u8) -> Address {
        Address::from_slice(&[n; 20])
    }

    fn topic_from_address(addr: Address) -> H256 {
        let mut bytes = [0u8; 32];
        bytes[12..].copy_from_slice(addr.as_bytes());
        H256::from(bytes)
    }

    fn log(topics: Vec<H256>, data: Vec<Token>) -> Log {
        Log {
            topics,
            data: abi::encode(&data).into(),
            ..Default::default()
        }
    }

    #[test]
    fn decodes_create_table() {
        let decoder = EventDecoder::new();
        let owner = address(0xAA);
        let log = log(
            vec![decoder.create_table, topic_from_address(owner)],
            vec![
                Token::Uint(U256::from(42u64)),
                Token::String("create table foo_1337 (bar int)".to_string()),
            ],
        );

        let event = decoder.decode(&log).unwrap().unwrap();
        assert_eq!(
            event,
            TableEvent::CreateTable {
                owner: format_address(owner),
                table_id: 42,
                statement: "create table foo_1337 (bar int)".to_string(),
            }
        );
    }

    #[test]
    fn decodes_run_sql() {
        let decoder = EventDecoder::new();
        let caller = address(0xBB);
        let log = log(
            vec![decoder.run_sql, topic_from_address(caller)],
            vec![
                Token::Bool(true),
                Token::Uint(U256::from(7u64)),
                Token::String("insert into foo_1337_7 values (1)".to_string()),
            ],
        );

        let event = decoder.decode(&log).unwrap().unwrap();
        assert_eq!(
            event,
            TableEvent::RunSql {
                caller: format_address(caller),
                is_owner: true,
                table_id: 7,
                statement: "insert into foo_1337_7 values (1)".to_string(),
            }
        );
    }

    #[test]
    fn decodes_set_controller_and_transfer() {
        let decoder = EventDecoder::new();
        let caller = address(0x01);
        let controller = address(0x02);

        let set = log(
            vec![decoder.set_controller, topic_from_address(caller)],
            vec![Token::Uint(U256::from(3u64)), Token::Address(controller)],
        );
        assert_eq!(
            decoder.decode(&set).unwrap().unwrap(),
            TableEvent::SetController {
                caller: format_address(caller),
                table_id: 3,
                controller: format_address(controller),
            }
        );

        let mut token_id = [0u8; 32];
        token_id[31] = 9;
        let transfer = Log {
            topics: vec![
                decoder.transfer,
                topic_from_address(caller),
                topic_from_address(controller),
                H256::from(token_id),
            ],
            ..Default::default()
        };
        assert_eq!(
            decoder.decode(&transfer).unwrap().unwrap(),
            TableEvent::TransferTable {
                from: format_address(caller),
                to: format_address(controller),
                table_id: 9,
            }
        );
    }

    #[test]
    fn skips_unknown_topics() {
        let decoder = EventDecoder::new();
        let unknown = Log {
            topics: vec![H256::from(keccak256("Other(uint256)"))],
            ..Default::default()
        };
        assert!(decoder.decode(&unknown).unwrap().is_none());
    }

    #[test]
    fn malformed_known_event_is_an_error() {
        let decoder = EventDecoder::new();
        let broken = Log {
            topics: vec![decoder.create_table, topic_from_address(address(1))],
            data: vec![0xde, 0xad].into(),
            ..Default::default()
        };
        assert!(decoder.decode(&broken).is_err());
    }
}
