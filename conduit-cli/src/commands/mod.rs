pub mod inspect;
pub mod receive;
pub mod send;
pub mod simulate;
