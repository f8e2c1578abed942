mod fakes;
mod manager;
