//! Model-serving registry: fitted classifiers run in worker processes while
//! the server keeps one worker per model and pairs every call with its reply.

pub mod web;
