pub mod db;
pub mod lock;
pub mod reservations;
pub mod sweeper;
