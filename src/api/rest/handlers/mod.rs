pub mod labs;
