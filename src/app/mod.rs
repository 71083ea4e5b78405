pub mod classify_use_case;
pub mod consume_use_case;
pub mod launch_use_case;
pub mod ledger_use_case;
pub mod migration_use_case;
pub mod ports;
