pub mod runtime;

pub use runtime::LuaPlanner;
