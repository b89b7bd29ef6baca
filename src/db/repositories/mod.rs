mod hour_bank;
mod plans;
mod sessions;
