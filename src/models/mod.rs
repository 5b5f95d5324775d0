pub mod claim;
pub mod member;
pub mod roster;
pub mod stop;
pub mod trip;
