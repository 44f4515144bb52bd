mod auction_flow;
mod flaky_store;
mod reporting;
