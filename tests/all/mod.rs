//! Integration tests. They expect a RabbitMq broker listening on `localhost:5672`
//! with the stock `guest`/`guest` credentials, e.g. the official Docker image.

mod consuming;
mod pools;
mod publishing;
