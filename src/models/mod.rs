mod account;
mod balance;
mod contract;
mod order;
mod position;
mod trade;

pub use account::{Account, AccountType};
pub use balance::{Balance, COLLATERAL_ASSET};
pub use contract::{Contract, ContractStatus};
pub use order::{
    LockedAsset, Order, OrderError, OrderRequest, OrderStatus, OrderType, PlaceOrderResult, Side,
};
pub use position::{MarginType, Position, PositionMode};
pub use trade::{SubTrade, Trade};
