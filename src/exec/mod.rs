pub mod executor;
pub mod leaderboard;

pub use executor::{execute, ExecOptions};
pub use leaderboard::{build_leaderboard, Leaderboard, LeaderboardEntry, PeriodSlice};
