// End-to-end tests over real TCP sockets. `support` provides a scripted VM
// and a scripted external debugger.
mod process;
mod proxy;
mod support;
