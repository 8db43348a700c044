//! Embedded status page
//!
//! A single self-contained page that subscribes to the SSE endpoint and
//! renders the live snapshot. Kept intentionally tiny; the gateway is not a
//! web application.

pub const STATUS_PAGE: &str = r#"<!doctype html>
<html>
<head>
<meta charset="utf-8">
<title>tsgate status</title>
<style>
  body { font-family: monospace; margin: 2em; background: #111; color: #ddd; }
  h1 { font-size: 1.2em; }
  table { border-collapse: collapse; margin-bottom: 1.5em; }
  td, th { border: 1px solid #444; padding: 0.3em 0.8em; text-align: left; }
  #logs { white-space: pre-wrap; font-size: 0.85em; color: #9a9; }
</style>
</head>
<body>
<h1>tsgate</h1>
<div id="summary">connecting&hellip;</div>
<h2>Clients</h2>
<table id="clients"><tr><th>id</th><th>peer</th><th>url</th><th>state</th><th>bandwidth</th></tr></table>
<h2>Workers</h2>
<table id="workers"><tr><th>id</th><th>pid</th><th>clients</th><th>pool used/total</th><th>zerocopy</th></tr></table>
<h2>Log</h2>
<div id="logs"></div>
<script>
const es = new EventSource('/status/sse');
es.onmessage = (ev) => {
  const s = JSON.parse(ev.data);
  document.getElementById('summary').textContent =
    `v${s.version} | uptime ${(s.uptimeMs / 1000 | 0)}s | clients ${s.totalClients}/${s.maxClients} | loglevel ${s.currentLogLevel}`;
  const ct = document.getElementById('clients');
  ct.innerHTML = '<tr><th>id</th><th>peer</th><th>url</th><th>state</th><th>bandwidth</th></tr>' +
    s.clients.map(c => `<tr><td>${c.id}</td><td>${c.peer}</td><td>${c.url}</td><td>${c.state}</td><td>${(c.bandwidth / 1000).toFixed(0)} kbit/s</td></tr>`).join('');
  const wt = document.getElementById('workers');
  wt.innerHTML = '<tr><th>id</th><th>pid</th><th>clients</th><th>pool used/total</th><th>zerocopy</th></tr>' +
    s.workers.map(w => `<tr><td>${w.id}</td><td>${w.pid}</td><td>${w.activeClients}</td><td>${w.pool.used}/${w.pool.total}</td><td>${w.send.completions} done, ${w.send.copied} copied</td></tr>`).join('');
  document.getElementById('logs').textContent =
    s.logs.slice(-40).map(l => `${new Date(l.timestampMs).toISOString()} [${l.level}] ${l.message}`).join('\n');
};
</script>
</body>
</html>
"#;
